//! Terraform module registry backed by GitHub tags.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
