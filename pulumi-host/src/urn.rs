//! Uniform resource names.
//!
//! A URN uniquely identifies a resource within a stack:
//!
//! ```text
//! urn:pulumi:<stack>::<project>::[<parentType>$]<type>::<name>
//! ```
//!
//! where `<type>` is a `package[:module]:typeName` token. The name component
//! may itself contain `::`, so parsing splits on the first three separators
//! only.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The prefix of every URN.
pub const URN_PREFIX: &str = "urn:pulumi:";

const URN_NAME_DELIMITER: &str = "::";
const URN_TYPE_DELIMITER: &str = "$";

/// An error produced when a string is not a well-formed URN.
#[derive(Debug, Error)]
#[error("invalid URN '{urn}': {reason}")]
pub struct UrnParseError {
    urn: String,
    reason: &'static str,
}

/// A uniform resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Urn(String);

impl Urn {
    /// Construct a URN from its components.
    pub fn new(stack: &str, project: &str, parent_type: Option<&str>, ty: &str, name: &str) -> Self {
        let qualified = match parent_type {
            Some(parent) => format!("{parent}{URN_TYPE_DELIMITER}{ty}"),
            None => ty.to_string(),
        };
        Urn(format!(
            "{URN_PREFIX}{stack}{URN_NAME_DELIMITER}{project}{URN_NAME_DELIMITER}{qualified}{URN_NAME_DELIMITER}{name}"
        ))
    }

    /// Parse and validate a URN.
    pub fn parse(s: &str) -> Result<Self, UrnParseError> {
        let err = |reason| UrnParseError {
            urn: s.to_string(),
            reason,
        };
        let rest = s.strip_prefix(URN_PREFIX).ok_or_else(|| err("missing 'urn:pulumi:' prefix"))?;
        let parts: Vec<&str> = rest.splitn(4, URN_NAME_DELIMITER).collect();
        if parts.len() != 4 {
            return Err(err("expected '<stack>::<project>::<type>::<name>'"));
        }
        if parts[0].is_empty() || parts[1].is_empty() || parts[2].is_empty() {
            return Err(err("stack, project, and type must be non-empty"));
        }
        Ok(Urn(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn component(&self, index: usize) -> &str {
        self.0[URN_PREFIX.len()..]
            .splitn(4, URN_NAME_DELIMITER)
            .nth(index)
            .unwrap_or("")
    }

    /// The stack the resource belongs to.
    pub fn stack(&self) -> &str {
        self.component(0)
    }

    /// The project the resource belongs to.
    pub fn project(&self) -> &str {
        self.component(1)
    }

    /// The full, possibly parent-qualified type token.
    pub fn qualified_type(&self) -> &str {
        self.component(2)
    }

    /// The resource's own type token, with any parent qualification removed.
    pub fn type_token(&self) -> &str {
        self.qualified_type()
            .rsplit(URN_TYPE_DELIMITER)
            .next()
            .unwrap_or("")
    }

    /// The resource name.
    pub fn name(&self) -> &str {
        self.component(3)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Urn {
    type Err = UrnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Urn::parse(s)
    }
}

impl AsRef<str> for Urn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_components() {
        let urn = Urn::parse("urn:pulumi:dev::acmecorp::aws:s3/bucket:Bucket::logs").unwrap();
        assert_eq!(urn.stack(), "dev");
        assert_eq!(urn.project(), "acmecorp");
        assert_eq!(urn.qualified_type(), "aws:s3/bucket:Bucket");
        assert_eq!(urn.type_token(), "aws:s3/bucket:Bucket");
        assert_eq!(urn.name(), "logs");
    }

    #[test]
    fn strips_parent_qualification() {
        let urn =
            Urn::parse("urn:pulumi:dev::proj::aws:cloudformation:Stack$aws:s3/bucket:Bucket::b")
                .unwrap();
        assert_eq!(urn.qualified_type(), "aws:cloudformation:Stack$aws:s3/bucket:Bucket");
        assert_eq!(urn.type_token(), "aws:s3/bucket:Bucket");
    }

    #[test]
    fn name_may_contain_separators() {
        let urn = Urn::parse("urn:pulumi:dev::proj::t:m:T::odd::name").unwrap();
        assert_eq!(urn.name(), "odd::name");
    }

    #[test]
    fn round_trips_through_new() {
        let urn = Urn::new("dev", "proj", Some("parent:m:P"), "t:m:T", "res");
        assert_eq!(urn.as_str(), "urn:pulumi:dev::proj::parent:m:P$t:m:T::res");
        assert!(Urn::parse(urn.as_str()).is_ok());
    }

    #[test]
    fn rejects_malformed() {
        assert!(Urn::parse("urn:other:dev::p::t::n").is_err());
        assert!(Urn::parse("urn:pulumi:dev::p").is_err());
    }
}
