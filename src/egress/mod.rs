//! Everything that leaves the proxy towards a destination: direct dials,
//! upstream `CONNECT` negotiation and the pooled forwarding clients.

pub mod dialer;
pub mod round_trippers;
pub mod upstream;

pub use dialer::{format_authority, Dialer, DEFAULT_CONNECT_TIMEOUT};
pub use round_trippers::{
    connection_info, ConnectionInfo, EgressConnection, EgressConnector, RoundTripper,
    RoundTripperKey, RoundTrippers, TransportSettings,
};
