pub mod entity;
pub mod room;
