//! Kuza Network Layer
//!
//! Domain-to-address resolution for the routing rule compiler.
//!
//! Resolution order for a domain:
//! 1. Static bootstrap table (longest matching suffix wins)
//! 2. Resolution cache (positive and negative entries)
//! 3. Live DNS lookup through hickory, cached on the way out
//!
//! Every resolved address is widened to an exact host range (`/32` or
//! `/128`), never to the surrounding subnet.

mod address_table;
mod resolver;

pub use address_table::{host_range, normalize_domain, suffix_matches, StaticAddressTable};
pub use resolver::{AddressResolver, DnsConfig, HickoryLookup, LiveLookup, ResolveError};
