pub mod bam;
pub mod bucket;
pub mod catalogue;
pub mod checks;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod key_parser;
pub mod notification;
pub mod output;
pub mod registry;
pub mod retry;
pub mod rules;
pub mod storage;
pub mod tracker;
pub mod verdict;
pub mod worker;
