//! Kubeconfig loading.
//!
//! Only the parts needed to reach a cluster are modelled: clusters, users and
//! contexts. Everything else in the document is ignored.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KubeConfig {
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cluster {
    pub server: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: UserAuth,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserAuth {
    pub token: Option<String>,
    #[serde(rename = "client-certificate-data")]
    pub client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data")]
    pub client_key_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextRef {
    pub cluster: String,
    pub user: String,
}

impl KubeConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("Failed to parse kubeconfig")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read kubeconfig: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Invalid kubeconfig: {}", path.display()))
    }

    /// First entry of `$KUBECONFIG`, else `~/.kube/config`
    pub fn default_path() -> Result<PathBuf> {
        if let Some(value) = std::env::var_os("KUBECONFIG") {
            if let Some(first) = std::env::split_paths(&value).find(|p| !p.as_os_str().is_empty())
            {
                return Ok(first);
            }
        }

        let dirs = directories::UserDirs::new().context("Could not determine home directory")?;
        Ok(dirs.home_dir().join(".kube").join("config"))
    }

    pub fn context(&self, name: &str) -> Option<&ContextRef> {
        self.contexts
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.context)
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.cluster)
    }

    pub fn user(&self, name: &str) -> Option<&UserAuth> {
        self.users.iter().find(|u| u.name == name).map(|u| &u.user)
    }
}
