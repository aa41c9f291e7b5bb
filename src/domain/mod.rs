//! Domain types: identities, requests, matching, errors and settings.
//!
//! Nothing here talks to the radio; see [`crate::infrastructure`] for that.

pub mod error;
pub mod matcher;
pub mod models;
pub mod operation;
pub mod request;
pub mod settings;
