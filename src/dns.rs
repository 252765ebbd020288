use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;

// A PTR name is accepted only if at least one of its A/AAAA answers
// resolves back to the address we started from.
pub async fn forward_confirmed_reverse(ip: IpAddr) -> Option<String> {
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    let ptr = match resolver.reverse_lookup(ip).await {
        Ok(p) => p,
        Err(e) => {
            debug!("No PTR record for {}: {}", ip, e);
            return None;
        }
    };

    for name in ptr.iter() {
        let candidate = strip_root(&name.to_string()).to_string();
        match resolver.lookup_ip(candidate.as_str()).await {
            Ok(forward) => {
                if forward.iter().any(|a| a == ip) {
                    return Some(candidate);
                }
                debug!("PTR candidate {} does not resolve back to {}", candidate, ip);
            }
            Err(e) => debug!("Forward lookup of {} failed: {}", candidate, e),
        }
    }

    None
}

fn strip_root(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_root_removes_single_trailing_dot() {
        assert_eq!(strip_root("h5.example.org."), "h5.example.org");
        assert_eq!(strip_root("h5.example.org"), "h5.example.org");
        assert_eq!(strip_root(""), "");
    }
}
