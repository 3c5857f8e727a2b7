pub mod cert_gen;
pub mod stcp_proto;
pub mod tls;
