#![forbid(unsafe_code)]

pub mod demo;

pub use self::demo::DemoAdapter;
