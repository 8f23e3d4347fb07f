pub mod adapters;
pub mod fs;
pub mod processors;
pub mod rules;
pub mod search;
pub mod tasks;
pub mod webdav;
