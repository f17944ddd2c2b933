use thiserror::Error;

pub type CbResult<T> = Result<T, CbError>;

/// Value-level rejection raised by the numeric guards.
///
/// Domain crates wrap this in their own parameter-rejection variants with
/// `#[from]`, so the offending field name and the violated rule travel
/// together to whatever layer reports the failure.
#[derive(Error, Debug)]
pub enum CbError {
    #[error("{what} is not finite (got {value})")]
    NonFinite { what: &'static str, value: f64 },

    #[error("{what} must be positive (got {value})")]
    NotPositive { what: &'static str, value: f64 },

    #[error("{what} must be non-negative (got {value})")]
    Negative { what: &'static str, value: f64 },

    /// A relation between values, stated by the caller.
    #[error("{what}")]
    Constraint { what: &'static str },
}
