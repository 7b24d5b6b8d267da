pub mod lead;
pub mod outcome;
pub mod quota;
pub mod rule;
