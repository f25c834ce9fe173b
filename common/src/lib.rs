// Allow some clippy lints for legacy code - to be fixed gradually
#![allow(clippy::module_inception)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod api;
pub mod block;
pub mod config;
pub mod crypto;
pub mod error;
pub mod internode;
pub mod time;
pub mod transaction;
