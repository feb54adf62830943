#![deny(clippy::unwrap_used)]
#![allow(clippy::from_over_into)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod category;
pub mod category_path;
pub mod config;
pub mod import;
pub mod manufacturer;
pub mod product;
pub mod search;
pub mod sku;
