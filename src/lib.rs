//! Event-triggered image classification.
//!
//! An object-storage "finalized" CloudEvent arrives over HTTP; the referenced
//! image is downloaded, preprocessed, classified by a model loaded once at
//! startup, and the verdict is upserted into the result store.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
