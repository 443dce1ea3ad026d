//! Helpers shared by store-level tests.

mod postgres;

pub use postgres::postgres_setup;
