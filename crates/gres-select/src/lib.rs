pub mod common;
pub mod gres;
pub mod select;

#[cfg(test)]
pub(crate) mod test_util;

pub type Error = common::error::SelectError;
pub type Result<T> = std::result::Result<T, Error>;
