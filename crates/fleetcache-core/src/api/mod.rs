//! Remote device-management API.
//!
//! This module provides the `DeviceGateway` port the sync engine talks to
//! and `GraphClient`, its Microsoft Graph implementation. Requests carry a
//! bearer token from a `TokenProvider` and every call runs under a budget.

pub mod client;
pub mod error;
pub mod gateway;

pub use client::{GraphClient, DEFAULT_GRAPH_URL};
pub use error::GatewayError;
pub use gateway::{
    DeviceGateway, DeviceListing, RemediationAction, DEFAULT_DETAIL_TIMEOUT, DEFAULT_LIST_TIMEOUT,
};
