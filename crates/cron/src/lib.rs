//! `belfry-cron` — Quartz-style cron expression parsing and evaluation.
//!
//! # Syntax
//!
//! Six or seven whitespace-separated fields:
//!
//! | Field        | Range      | Extras                         |
//! |--------------|------------|--------------------------------|
//! | seconds      | 0–59       | `, - * /`                      |
//! | minutes      | 0–59       | `, - * /`                      |
//! | hours        | 0–23       | `, - * /`                      |
//! | day-of-month | 1–31       | `, - * / ? L LW dW`            |
//! | month        | 1–12       | `, - * /` and `JAN`..`DEC`     |
//! | day-of-week  | 1–7 (1=SUN)| `, - * / ? dL d#n` and names   |
//! | year         | 1970–2099  | optional; `, - * /`            |
//!
//! Exactly one of day-of-month / day-of-week must be `?`.
//!
//! [`CronExpression::next_after_ms`] computes the next satisfying instant
//! strictly after a given epoch-millisecond timestamp, evaluated in an IANA
//! time zone. Local times skipped by daylight-saving transitions are treated
//! as non-existent; repeated local times fire once, on the first occurrence.

pub mod error;
mod expression;
mod field;

pub use {
    error::{ParseError, Result},
    expression::CronExpression,
};
