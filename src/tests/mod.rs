mod common;

mod config_validation;
mod reference_resolution;
