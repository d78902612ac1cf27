//! Datasource connectors ("features").
//!
//! Each connector binds one datasource tag to its crawl/load handlers, its
//! deletion-key strategy and its source API client. The registry consults
//! the features in order; the first accepting one wins.

pub mod deleter;
pub mod drive;
pub mod files;
pub mod http;
pub mod hub;
pub mod kms;
pub mod wiki;

/// The closed set of datasource tags.
pub mod datasource {
    /// Knowledge management service (API-backed articles).
    pub const KMS: &str = "KMS";
    /// Wiki pages, crawled from a configured root page.
    pub const WIKI: &str = "WIKI";
    /// Hosted knowledge-article platform with templated articles, keyed by
    /// display id.
    pub const DRIVE: &str = "DRV";
    /// Support-hub knowledge base with free-form content sections.
    pub const HUB: &str = "HUB";
    /// Local filesystem directory.
    pub const FILES: &str = "FS";
}
