#![allow(dead_code)]

pub mod chain;
pub mod fakes;
pub mod invoice;
pub mod wait;
