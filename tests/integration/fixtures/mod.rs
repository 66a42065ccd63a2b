#![allow(dead_code)]

pub mod daemon_dir;
pub mod pipeline;
pub mod wait;
