// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, net::SocketAddr};

use crate::config::Role;

/// An endpoint address decorated with the Noise pattern and handshake role.
///
/// The network tag of the underlying transport gains a `noise+` prefix, and
/// the string form is `noise://<pattern>/<role>[/<addr>]`, the address part
/// omitted when the underlying endpoint is unknown (e.g. an in-memory
/// channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseAddr {
    pattern: String,
    role: Role,
    inner: Option<SocketAddr>,
}

impl NoiseAddr {
    /// Creates an address for the given pattern, role and underlying endpoint.
    pub fn new(pattern: impl Into<String>, role: Role, inner: Option<SocketAddr>) -> Self {
        Self {
            pattern: pattern.into(),
            role,
            inner,
        }
    }

    /// Network tag: `"noise+tcp"` over a socket, bare `"noise"` otherwise.
    pub fn network(&self) -> String {
        match self.inner {
            Some(_) => "noise+tcp".to_owned(),
            None => "noise".to_owned(),
        }
    }

    /// The Noise pattern of the connection.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The handshake role of the local side.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The underlying socket address, when known.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.inner
    }
}

impl fmt::Display for NoiseAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "noise://{}/{}", self.pattern, self.role)?;
        if let Some(addr) = self.inner {
            write!(f, "/{}", addr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::NoiseAddr;
    use crate::config::Role;

    #[test]
    fn formatting_with_underlying_address() {
        let addr = NoiseAddr::new(
            "XK",
            Role::Initiator,
            Some("127.0.0.1:9000".parse().unwrap()),
        );
        assert_eq!(addr.network(), "noise+tcp");
        assert_eq!(addr.to_string(), "noise://XK/initiator/127.0.0.1:9000");
    }

    #[test]
    fn formatting_without_underlying_address() {
        let addr = NoiseAddr::new("NN", Role::Responder, None);
        assert_eq!(addr.network(), "noise");
        assert_eq!(addr.to_string(), "noise://NN/responder");
    }
}
