//! Web service access layer.
//!
//! This module provides the `WsClient` for calling the site's REST and AJAX
//! endpoints. Calls carry a `WsPresets` describing the site, the token and the
//! expected response type.
//!
//! Identical concurrent calls share one request, and calls made while the
//! server signals overload (HTTP 429) wait in a shared queue and are replayed
//! in order once the cooldown ends.

pub mod client;
pub mod dedup;
pub mod error;
pub mod file_info;
pub mod request;
pub mod retry_queue;
pub mod transport;

pub use client::{WriteObserver, WsClient, MOBILE_SERVICE};
pub use dedup::InFlightCalls;
pub use error::WsError;
pub use file_info::{DownloadDecision, RemoteFileInfo};
pub use request::{TypeExpected, WsPresets};
pub use transport::{HeadInfo, HttpTransport, RawResponse, Transport};
