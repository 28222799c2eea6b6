//! # Product monitoring.
//!
//! Everything that turns a [`ProductMatcher`] into a purchasable variant:
//!
//! - [`ProductMatcher`] / [`MonitorKey`] what a task wants and how monitors are deduplicated
//! - [`Parser`] / [`ParserFactory`]     pluggable resolution, raced by the monitor
//! - [`Monitor`] / [`MonitorHandle`]    the polling loop and its shared channels
//! - [`pick_variant`]                   size selection inside a resolved product

mod matcher;
mod parser;
mod product;
mod runner;

pub use matcher::{MonitorKey, NormalizedMatcher, ProductMatcher};
pub use parser::{DefaultParsers, JsonParser, Parser, ParserFactory, race};
pub use product::{Pick, Product, Variant, pick_variant};
pub use runner::{Monitor, MonitorDeps, MonitorHandle};
