//! Front-ends driving a console session.

pub mod terminal;
pub mod web;
