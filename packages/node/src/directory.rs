//! Member directory: where a member's pod lives and which Data certificate
//! signs for it.
//!
//! Entries are read from the local cache first. On a miss the configured
//! directory service is asked at `GET {directory_url}/v1/members/{member_id}`
//! and the answer is cached. Entries can also be seeded directly with
//! [`MemberDirectory::register`].

use std::sync::Arc;

use podnet_node_api::MemberInfo;
use uuid::Uuid;

use crate::{
    error::NodeError,
    gateway::{ApiGateway, ApiRequest},
    identity::PodIdentity,
    storage::Storage,
};

#[derive(Clone)]
pub struct MemberDirectory {
    storage: Arc<dyn Storage>,
    gateway: ApiGateway,
    identity: Arc<PodIdentity>,
    directory_url: Option<String>,
}

impl MemberDirectory {
    pub fn new(
        storage: Arc<dyn Storage>,
        gateway: ApiGateway,
        identity: Arc<PodIdentity>,
        directory_url: Option<String>,
    ) -> Self {
        Self {
            storage,
            gateway,
            identity,
            directory_url,
        }
    }

    pub async fn register(&self, member: &MemberInfo) -> Result<(), NodeError> {
        self.storage.put_member(member).await?;
        Ok(())
    }

    pub async fn cached(&self, member_id: Uuid) -> Result<Option<MemberInfo>, NodeError> {
        Ok(self.storage.get_member(member_id).await?)
    }

    /// Resolve `member_id`, asking the directory service on a cache miss.
    ///
    /// # Errors
    ///
    /// [`NodeError::MemberNotFound`] when the member is not cached and no
    /// directory is configured; [`NodeError::RemoteCallFailed`] when the
    /// directory cannot answer.
    pub async fn resolve(&self, member_id: Uuid) -> Result<MemberInfo, NodeError> {
        if let Some(member) = self.cached(member_id).await? {
            return Ok(member);
        }
        let Some(base) = &self.directory_url else {
            return Err(NodeError::MemberNotFound(member_id));
        };

        let request = ApiRequest::get("{base}/v1/members/{member_id}")
            .context("base", base.as_str())
            .context("member_id", member_id.to_string());
        let response = self
            .gateway
            .call(request, self.identity.client.as_ref())
            .await?;
        let member: MemberInfo = response.json()?;
        if member.member_id != member_id {
            return Err(NodeError::remote(
                response.url.as_str(),
                format!("directory answered for {} instead of {member_id}", member.member_id),
            ));
        }
        tracing::debug!("directory: cached {member_id} at {}", member.pod_url);
        self.storage.put_member(&member).await?;
        Ok(member)
    }
}
