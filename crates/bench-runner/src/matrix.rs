use std::fmt;

use serde::Serialize;

use crate::config::Profile;
use crate::error::Result;

/// One (mode, scale, query) unit of work. `query_index` is the query's
/// position in its mode's list; partition overrides are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Combination {
    pub mode: String,
    pub scale: u32,
    pub query: String,
    pub query_index: usize,
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/sf_{}/{}", self.mode, self.scale, self.query)
    }
}

/// Enumerates modes, then scales, then queries, each in declaration order.
/// An empty dimension yields no combinations.
pub fn enumerate(profile: &Profile) -> Result<Vec<Combination>> {
    let mut out = Vec::new();
    for mode in &profile.modes {
        let queries = profile.queries_for(mode)?;
        for &scale in &profile.scales {
            for (query_index, query) in queries.iter().enumerate() {
                out.push(Combination {
                    mode: mode.clone(),
                    scale,
                    query: query.clone(),
                    query_index,
                });
            }
        }
    }
    Ok(out)
}
