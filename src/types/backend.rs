use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution backend family a model descriptor and provider belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Native inference binary invoked as a subprocess.
    LocalInference,
    /// Remote chat-completions style HTTP service.
    RemoteChatHttp,
    /// Local model server speaking a JSON-lines HTTP API.
    LocalServerHttp,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::LocalInference,
        BackendKind::RemoteChatHttp,
        BackendKind::LocalServerHttp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalInference => "local-inference",
            Self::RemoteChatHttp => "remote-chat-http",
            Self::LocalServerHttp => "local-server-http",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown backend kind '{}'", s))
    }
}
