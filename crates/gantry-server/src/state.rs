//! Shared application state for HTTP handlers.

use std::sync::Arc;

use gantry_core::Application;

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub app: Arc<Application>,
    /// Outbound client for gallery index fetches.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(app: Arc<Application>) -> Self {
        Self {
            app,
            http: reqwest::Client::new(),
        }
    }

    /// Map a core error to its HTTP shape, honoring the opaque-errors
    /// hardening flag.
    pub fn api_error(&self, err: gantry_core::Error) -> ApiError {
        ApiError::from_core(err, self.app.opts.opaque_errors)
    }
}
