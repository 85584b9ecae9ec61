pub mod auth;
pub mod handshake;
pub mod packet;

pub use auth::authenticate_backend;
pub use handshake::{build_handshake_v10, generate_scramble, mysql_native_password, parse_handshake_response, verify_native_password, HandshakeResponse};
pub use packet::{read_packet, write_packet, Packet};
