use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use anyhow::{anyhow, bail, Context};
use bytes::{Buf, BufMut};

use crate::network::protocol::WireError;
use crate::util::buf::{put_string, try_get_string, try_get_u16};


/// The address of an RPC environment, as announced to peers. This is a host name (or literal IP)
///  and port rather than a [SocketAddr] because it is resolved by whoever connects to it.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RpcAddress {
    pub host: String,
    pub port: u16,
}

impl Display for RpcAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        }
        else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for RpcAddress {
    fn from(value: SocketAddr) -> Self {
        RpcAddress::new(&value.ip().to_string(), value.port())
    }
}

impl RpcAddress {
    pub fn new(host: &str, port: u16) -> RpcAddress {
        RpcAddress {
            host: host.to_string(),
            port,
        }
    }

    /// Parses a URL of the form `scheme://host:port`. IPv6 hosts are written in brackets, e.g.
    ///  `masterlink://[::1]:7077`. Paths, queries and user info are rejected.
    pub fn from_url(url: &str) -> anyhow::Result<RpcAddress> {
        let (scheme, rest) = url.split_once("://")
            .ok_or_else(|| anyhow!("invalid master URL {:?}: missing scheme", url))?;
        if scheme.is_empty() {
            bail!("invalid master URL {:?}: empty scheme", url);
        }
        if rest.contains(['/', '?', '#', '@']) {
            bail!("invalid master URL {:?}: only host and port are allowed", url);
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']')
                .ok_or_else(|| anyhow!("invalid master URL {:?}: unterminated IPv6 address", url))?;
            let port = after.strip_prefix(':')
                .ok_or_else(|| anyhow!("invalid master URL {:?}: missing port", url))?;
            (host, port)
        }
        else {
            rest.rsplit_once(':')
                .ok_or_else(|| anyhow!("invalid master URL {:?}: missing port", url))?
        };

        if host.is_empty() {
            bail!("invalid master URL {:?}: missing host", url);
        }
        let port = port.parse::<u16>()
            .with_context(|| format!("invalid master URL {:?}: bad port", url))?;

        Ok(RpcAddress::new(host, port))
    }

    pub async fn resolve(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port)).await
            .with_context(|| format!("resolving {}", self))?
            .next()
            .ok_or_else(|| anyhow!("{} did not resolve to any address", self))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.host);
        buf.put_u16(self.port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<RpcAddress, WireError> {
        let host = try_get_string(buf, "rpc address host")?;
        let port = try_get_u16(buf, "rpc address port")?;
        Ok(RpcAddress { host, port })
    }
}


#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::host("masterlink://master-1:7077", "master-1", 7077)]
    #[case::ipv4("spark://10.1.2.3:1", "10.1.2.3", 1)]
    #[case::ipv6("masterlink://[::1]:7077", "::1", 7077)]
    fn test_from_url(#[case] url: &str, #[case] host: &str, #[case] port: u16) {
        assert_eq!(RpcAddress::from_url(url).unwrap(), RpcAddress::new(host, port));
    }

    #[rstest]
    #[case::no_scheme("master:7077")]
    #[case::empty_scheme("://master:7077")]
    #[case::no_port("masterlink://master")]
    #[case::bad_port("masterlink://master:abc")]
    #[case::port_out_of_range("masterlink://master:70000")]
    #[case::no_host("masterlink://:7077")]
    #[case::path("masterlink://master:7077/x")]
    #[case::user("masterlink://user@master:7077")]
    #[case::unterminated_ipv6("masterlink://[::1:7077")]
    fn test_from_url_invalid(#[case] url: &str) {
        assert!(RpcAddress::from_url(url).is_err());
    }

    #[rstest]
    #[case::host(RpcAddress::new("master", 7077), "master:7077")]
    #[case::ipv6(RpcAddress::new("::1", 1), "[::1]:1")]
    fn test_display(#[case] address: RpcAddress, #[case] expected: &str) {
        assert_eq!(address.to_string(), expected);
    }

    #[test]
    fn test_ser() {
        let mut buf = BytesMut::new();
        RpcAddress::new("m", 258).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[1, b'm', 1, 2]);

        let mut parse_buf = buf.freeze();
        assert_eq!(RpcAddress::try_deser(&mut parse_buf).unwrap(), RpcAddress::new("m", 258));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let resolved = RpcAddress::new("127.0.0.1", 4242).resolve().await.unwrap();
        assert_eq!(resolved, SocketAddr::from(([127, 0, 0, 1], 4242)));
    }
}
