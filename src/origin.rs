use crate::error::StorageError;
use std::fmt;
use url::{Host, Url};

/// A non-opaque `scheme://host[:port]` identity that owns key/value data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Origin {
    serialized: String,
    scheme: String,
    host: Host<String>,
}

impl Origin {
    /// Parses any URL and keeps only its origin. Opaque origins (`data:`,
    /// `file:`, ...) cannot own storage and are rejected.
    pub fn parse(input: &str) -> Result<Self, StorageError> {
        let url = Url::parse(input).map_err(|e| StorageError::InvalidOrigin {
            input: input.to_string(),
            reason: e.to_string(),
        })?;
        match url.origin() {
            url::Origin::Tuple(scheme, host, _) => Ok(Self {
                serialized: url.origin().ascii_serialization(),
                scheme,
                host,
            }),
            url::Origin::Opaque(_) => Err(StorageError::InvalidOrigin {
                input: input.to_string(),
                reason: "opaque origin".into(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> String {
        self.host.to_string()
    }

    pub fn site(&self) -> Site {
        Site::from_origin(self)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

/// `scheme://registrable-domain`; every origin under one site shares a
/// privacy budget.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Site(String);

impl Site {
    /// The registrable domain comes from the public suffix list. Hosts with
    /// none (IP addresses, bare suffixes, single labels) are kept whole.
    pub fn from_origin(origin: &Origin) -> Self {
        let host = match &origin.host {
            Host::Domain(domain) => {
                let domain = domain.trim_end_matches('.');
                psl::domain_str(domain).unwrap_or(domain).to_string()
            }
            other => other.to_string(),
        };
        Site(format!("{}://{}", origin.scheme, host))
    }

    pub fn parse(input: &str) -> Result<Self, StorageError> {
        Ok(Self::from_origin(&Origin::parse(input)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
