use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DOMAINNAME_OPTION: &str = "io.docker.network.domainname";
pub const HOSTNAME_OPTION: &str = "io.docker.network.hostname";

/// libnetwork's `types.CONNECTED`: the destination is reachable on-link.
pub const ROUTE_CONNECTED: u8 = 1;

// Requests.

#[derive(Deserialize, Debug, Clone)]
pub struct NetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "Options", default)]
    pub options: HashMap<String, Value>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "Options", default)]
    pub options: HashMap<String, Value>,
}

impl CreateEndpointRequest {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct EndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct JoinRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "SandboxKey", default)]
    pub sandbox_key: String,
}

// Responses.

#[derive(Serialize, Debug, PartialEq)]
pub struct HandshakeResponse {
    #[serde(rename = "Implements")]
    pub implements: Vec<String>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct CapabilitiesResponse {
    #[serde(rename = "Scope")]
    pub scope: String,
}

/// Serializes as `{}`.
#[derive(Serialize, Debug, Default, PartialEq)]
pub struct EmptyResponse {}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EndpointInterface {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CreateEndpointResponse {
    #[serde(rename = "Interfaces")]
    pub interfaces: Vec<EndpointInterface>,
}

#[derive(Serialize, Debug, Default, PartialEq)]
pub struct EndpointInfoResponse {
    #[serde(rename = "Value")]
    pub value: Map<String, Value>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InterfaceName {
    #[serde(rename = "SrcName")]
    pub src_name: String,
    #[serde(rename = "DstPrefix")]
    pub dst_prefix: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StaticRoute {
    #[serde(rename = "Destination")]
    pub destination: String,
    #[serde(rename = "RouteType")]
    pub route_type: u8,
    #[serde(rename = "NextHop")]
    pub next_hop: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JoinResponse {
    #[serde(rename = "InterfaceNames")]
    pub interface_names: Vec<InterfaceName>,
    #[serde(rename = "StaticRoutes", skip_serializing_if = "Option::is_none")]
    pub static_routes: Option<Vec<StaticRoute>>,
    #[serde(rename = "ResolvConfPath", skip_serializing_if = "Option::is_none")]
    pub resolv_conf_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_create_endpoint() {
        let req: CreateEndpointRequest = serde_json::from_value(json!({
            "NetworkID": "net1",
            "EndpointID": "ep1",
            "Interface": {"Address": "", "MacAddress": ""},
            "Options": {
                "io.docker.network.domainname": "weave.local",
                "io.docker.network.hostname": "foo",
                "com.docker.network.portmap": []
            }
        }))
        .unwrap();

        assert_eq!(req.network_id, "net1");
        assert_eq!(req.endpoint_id, "ep1");
        assert_eq!(req.option_str(DOMAINNAME_OPTION), Some("weave.local"));
        assert_eq!(req.option_str(HOSTNAME_OPTION), Some("foo"));
        assert_eq!(req.option_str("com.docker.network.portmap"), None);
    }

    #[test]
    fn test_options_are_optional() {
        let req: NetworkRequest = serde_json::from_str(r#"{"NetworkID":"net1"}"#).unwrap();
        assert!(req.options.is_empty());

        let req: JoinRequest =
            serde_json::from_str(r#"{"NetworkID":"net1","EndpointID":"ep1"}"#).unwrap();
        assert_eq!(req.sandbox_key, "");
    }

    #[test]
    fn test_missing_ids_rejected() {
        assert!(serde_json::from_str::<NetworkRequest>("{}").is_err());
        assert!(serde_json::from_str::<EndpointRequest>(r#"{"NetworkID":"n"}"#).is_err());
    }

    #[test]
    fn test_encode_responses() {
        assert_eq!(serde_json::to_value(EmptyResponse {}).unwrap(), json!({}));
        assert_eq!(
            serde_json::to_value(EndpointInfoResponse::default()).unwrap(),
            json!({"Value": {}})
        );

        let join = JoinResponse {
            interface_names: vec![InterfaceName {
                src_name: "vethwgabcde".to_string(),
                dst_prefix: "ethwe".to_string(),
            }],
            static_routes: None,
            resolv_conf_path: None,
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"InterfaceNames": [{"SrcName": "vethwgabcde", "DstPrefix": "ethwe"}]})
        );
    }
}
