//! Stowage Policy Library
//!
//! Tenants attach policies to traffic channels. A policy limits upload size,
//! throttles transfers, validates content type and decides encryption and
//! retention for the files it matches.

pub mod hub;
pub mod pattern;
pub mod reader;
pub mod service;
pub mod sniff;

pub use hub::{PolicyHub, Resolution};
pub use pattern::glob_match;
pub use reader::PolicyReader;
pub use service::{FilePolicyService, PolicyError};
pub use sniff::check_content_type;
