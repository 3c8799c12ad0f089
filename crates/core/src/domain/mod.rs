pub mod clarification;
pub mod provider;
pub mod registry;
pub mod run;
