//! The fixed wire response.
//!
//! Every successfully classified request receives the same empty-body
//! `200 OK`, and the connection is closed afterward.

/// The fixed response sent for any successfully classified request.
pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
