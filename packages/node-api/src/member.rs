//! Member directory entries — `GET|PUT /v1/members/{member_id}`.

use podnet::DataCertificate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a member's pod lives and how to check what it signs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberInfo {
    pub member_id: Uuid,
    pub service_id: String,
    /// Base URL of the member's pod, e.g. `https://0190c7a2.pods.example.net`.
    pub pod_url: String,
    pub data_certificate: DataCertificate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let info = MemberInfo {
            member_id: Uuid::nil(),
            service_id: "photos".into(),
            pod_url: "https://pod.example.net".into(),
            data_certificate: DataCertificate {
                public_key: "z6MkTest".into(),
            },
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["data_certificate"]["public_key"], "z6MkTest");
        assert_eq!(json["member_id"], "00000000-0000-0000-0000-000000000000");
    }
}
