//! Atelier API Service
//!
//! Backend for the Atelier storefront. This service registers and
//! authenticates shoppers in PostgreSQL, verifies email addresses by
//! dispatching one-time passcodes over SMTP through a bounded worker
//! pool, and accepts product media uploads (images, videos, 3D models)
//! onto category-partitioned local storage that is also served back
//! over HTTP.
//!
//! ## Features
//!
//! - **Account Lifecycle**: Signup, sign-in, and partial profile
//!   updates with bcrypt-hashed credentials
//! - **OTP Dispatch Pool**: At most a fixed number of verification
//!   emails in flight at once; excess requests wait in FIFO order and
//!   every caller gets a definite outcome
//! - **Typed Media Uploads**: Per-category size caps and format
//!   allow-lists, with partial-failure reporting per file
//! - **Image Retrieval**: Directory listings and base64 data-URL
//!   responses for stored images
//!
//! ## Architecture
//!
//! ```text
//! HTTP Clients                Dispatch Pool              PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Signup /     │           │ active ≤ cap │          │ users        │
//! │ Sign-in      │──────────▶│ ┌──┐┌──┐┌──┐ │          └──────────────┘
//! └──────────────┘           │ └──┘└──┘└──┘ │                 ▲
//!        │                   │  wait queue  │                 │
//!        │                   │  ▭ ▭ ▭ (FIFO)│                 │
//!        ▼                   └──────────────┘                 │
//! ┌──────────────┐                  │                         │
//! │ Verify       │                  ▼                         │
//! │ Endpoints    │           ┌──────────────┐          ┌──────────────┐
//! └──────────────┘           │ SMTP Mailer  │          │ User Store   │
//!        │                   └──────────────┘          └──────────────┘
//!        ▼
//! ┌──────────────┐           ┌──────────────┐
//! │ Media        │──────────▶│ File Store   │
//! │ Uploads      │           │ (per-type)   │
//! └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod mailer;
pub mod media;
pub mod otp;
pub mod products;
pub mod users;
pub mod verify;

pub use api::{create_router, start_api_server, AppState, ErrorBody, MessageResponse};
pub use config::Config;
pub use mailer::{Mailer, SmtpMailer};
pub use media::{FileStore, SaveError, StoredFile, UploadCategory};
pub use otp::{DispatchError, OtpDelivery, OtpDispatcher};
pub use users::{hash_password, verify_password, NewUser, ProfileFields, User, UserStore};
