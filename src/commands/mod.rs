pub mod findings;
pub mod history;
pub mod remediations;
pub mod run;
pub mod status;
