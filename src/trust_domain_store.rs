// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use spiffe::{SpiffeId, TrustDomain, X509Bundle, X509BundleSet};
#[cfg(feature = "tracing")]
use tracing::debug;

/// A set of SPIFFE trust domains a workload accepts peers from.
pub trait TrustDomainStore {
    /// The accepted trust domains.
    fn trust_domains(&self) -> &[TrustDomain];

    /// Concatenated DER of every authority the accepted trust domains have
    /// in `bundles`, or `None` if there is none.
    fn collect_root_certs(&self, bundles: &X509BundleSet) -> Option<Vec<u8>> {
        let mut roots = Vec::new();
        let mut authorities = 0_usize;
        for authority in self
            .trust_domains()
            .iter()
            .filter_map(|domain| bundles.get_bundle(domain))
            .flat_map(X509Bundle::authorities)
        {
            roots.extend_from_slice(authority.content());
            authorities += 1;
        }

        #[cfg(feature = "tracing")]
        debug!(authorities, trust_domains = self.trust_domains().len(), "collected root certs");

        (authorities > 0).then_some(roots)
    }

    /// Whether `id` belongs to one of the accepted trust domains.
    fn is_trusted(&self, id: &SpiffeId) -> bool {
        self.trust_domains()
            .iter()
            .any(|domain| domain == id.trust_domain())
    }
}

impl TrustDomainStore for Vec<TrustDomain> {
    fn trust_domains(&self) -> &[TrustDomain] {
        self
    }
}
