//! # Environment Variable Helpers

use batcher_errors::BatcherError;
use std::str::FromStr;

pub fn read_string_from_env(env_var: &'static str) -> Result<String, BatcherError> {
    std::env::var(env_var).map_err(|e| BatcherError::EnvVarNotSet(e, env_var))
}

pub fn read_string_from_env_then_parse<T: FromStr>(
    env_var: &'static str,
) -> Result<T, BatcherError>
where
    T::Err: std::fmt::Display,
{
    read_string_from_env(env_var)?
        .parse::<T>()
        .map_err(|e| BatcherError::EnvVarMalformed(env_var, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_malformed() {
        assert!(matches!(
            read_string_from_env("BATCHER_TEST_SURELY_UNSET"),
            Err(BatcherError::EnvVarNotSet(_, "BATCHER_TEST_SURELY_UNSET"))
        ));

        std::env::set_var("BATCHER_TEST_NOT_A_NUMBER", "abc");
        assert!(matches!(
            read_string_from_env_then_parse::<u64>("BATCHER_TEST_NOT_A_NUMBER"),
            Err(BatcherError::EnvVarMalformed("BATCHER_TEST_NOT_A_NUMBER", _))
        ));

        std::env::set_var("BATCHER_TEST_NUMBER", "42");
        assert_eq!(
            read_string_from_env_then_parse::<u64>("BATCHER_TEST_NUMBER").unwrap(),
            42
        );
    }
}
