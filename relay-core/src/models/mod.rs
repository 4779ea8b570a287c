pub mod history;
pub mod turn;
