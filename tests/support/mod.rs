#![allow(dead_code)]

pub mod fake_model;
pub mod glacier_env;
