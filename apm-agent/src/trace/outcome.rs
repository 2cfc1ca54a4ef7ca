use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Whether a transaction or span is considered successful.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The operation succeeded.
    Success,
    /// The operation failed, raised, or was abandoned before completion.
    Failure,
    /// The outcome was never determined.
    #[default]
    Unknown,
}

impl Outcome {
    /// Outcome of a transaction that produced an HTTP response: server
    /// errors are failures, everything else is a success.
    pub fn for_transaction_status(status_code: u16) -> Self {
        if status_code >= 500 {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }

    /// Outcome of an outbound HTTP span: any error status is a failure.
    pub fn for_span_status(status_code: u16) -> Self {
        if status_code >= 400 {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }

    /// The wire name of this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "unknown" => Ok(Outcome::Unknown),
            other => Err(format!("unknown outcome {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(200, Outcome::Success, Outcome::Success)]
    #[case(302, Outcome::Success, Outcome::Success)]
    #[case(404, Outcome::Success, Outcome::Failure)]
    #[case(500, Outcome::Failure, Outcome::Failure)]
    #[case(503, Outcome::Failure, Outcome::Failure)]
    fn status_code_mapping(
        #[case] status: u16,
        #[case] transaction: Outcome,
        #[case] span: Outcome,
    ) {
        assert_eq!(Outcome::for_transaction_status(status), transaction);
        assert_eq!(Outcome::for_span_status(status), span);
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Outcome::Failure).unwrap(), "\"failure\"");
        assert_eq!("Success".parse::<Outcome>(), Ok(Outcome::Success));
        assert!("maybe".parse::<Outcome>().is_err());
    }
}
