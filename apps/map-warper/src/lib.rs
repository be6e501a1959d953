pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod services;
pub mod state;

#[cfg(test)]
pub mod test_support;
