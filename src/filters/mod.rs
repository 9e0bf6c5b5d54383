//! Built-in filters
//!
//! * [`StubFilter`] answers configured hosts with a canned response.
//! * [`MitmFilter`] intercepts CONNECT tunnels of configured hosts.
//! * [`DirectFilter`] fetches everything else upstream; it is meant to be
//!   registered last.
//! * [`RawResponseFilter`] writes responses to the client unchanged.
mod direct;
mod mitm;
mod raw;
mod stub;

pub use direct::DirectFilter;
pub use mitm::MitmFilter;
pub use raw::RawResponseFilter;
pub use stub::StubFilter;
