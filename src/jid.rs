use std::fmt;
use std::str::FromStr;

/// Jabber identifier: `[local@]domain[/resource]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub local: Option<String>,
    pub domain: String,
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidError {
    #[error("empty domain in JID \"{0}\"")]
    EmptyDomain(String),
    #[error("empty localpart in JID \"{0}\"")]
    EmptyLocal(String),
    #[error("empty resource in JID \"{0}\"")]
    EmptyResource(String),
}

impl Jid {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            local: None,
            domain: domain.into(),
            resource: None,
        }
    }

    /// The JID without its resource.
    pub fn bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => {
                if resource.is_empty() {
                    return Err(JidError::EmptyResource(s.to_string()));
                }
                (rest, Some(resource.to_string()))
            }
            None => (s, None),
        };
        let (local, domain) = match rest.split_once('@') {
            Some((local, domain)) => {
                if local.is_empty() {
                    return Err(JidError::EmptyLocal(s.to_string()));
                }
                (Some(local.to_string()), domain)
            }
            None => (None, rest),
        };
        if domain.is_empty() {
            return Err(JidError::EmptyDomain(s.to_string()));
        }
        Ok(Jid {
            local,
            domain: domain.to_string(),
            resource,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}
