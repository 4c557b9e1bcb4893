//! The device URI boundary.
//!
//! `scheme://host:port[/path][?k1=v1&k2=v2]`. The scheme picks the
//! transport stack; for a ControlHub gateway the query's `target`
//! argument names the downstream device as `ip:port`.

use crate::{
    error::Error,
    pack::HubTarget,
};
use kstring::KString;
use nom::{
    bytes::complete::{
        tag,
        take_till,
        take_till1,
    },
    character::complete::digit1,
    combinator::{
        map_res,
        opt,
    },
    multi::separated_list0,
    sequence::{
        preceded,
        separated_pair,
        terminated,
    },
    IResult,
};
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    str::FromStr,
};

/// The transport stacks a URI can name
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Scheme {
    /// Plain IPbus datagrams straight to the device
    IpbusUdp,
    /// Plain IPbus over a length-prefixed stream straight to the device
    IpbusTcp,
    /// IPbus routed through a ControlHub gateway
    ChTcp,
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ipbusudp-2.0" => Scheme::IpbusUdp,
            "ipbustcp-2.0" => Scheme::IpbusTcp,
            "chtcp-2.0" => Scheme::ChTcp,
            _ => return Err(Error::UriParse(format!("unrecognized protocol `{s}`"))),
        })
    }
}

/// A parsed device URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
    pub args: HashMap<KString, String>,
}

fn scheme(input: &str) -> IResult<&str, &str> {
    terminated(take_till1(|c| c == ':'), tag("://"))(input)
}

fn host(input: &str) -> IResult<&str, &str> {
    terminated(take_till1(|c| c == ':'), tag(":"))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    map_res(digit1, str::parse)(input)
}

fn path(input: &str) -> IResult<&str, &str> {
    preceded(tag("/"), take_till(|c| c == '?'))(input)
}

fn key_value(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(take_till1(|c| c == '='), tag("="), take_till(|c| c == '&'))(input)
}

fn args(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    preceded(tag("?"), separated_list0(tag("&"), key_value))(input)
}

impl Uri {
    /// Parse a device URI
    /// # Errors
    /// Anything that fails to match the grammar is a [`Error::UriParse`].
    pub fn parse(input: &str) -> Result<Self, Error> {
        let bad = || Error::UriParse(input.to_string());
        let (rest, scheme_str) = scheme(input).map_err(|_| bad())?;
        let scheme = Scheme::from_str(scheme_str)?;
        let (rest, host) = host(rest).map_err(|_| bad())?;
        let (rest, port) = port(rest).map_err(|_| bad())?;
        let (rest, path) = opt(path)(rest).map_err(|_| bad())?;
        let (rest, arg_pairs) = opt(args)(rest).map_err(|_| bad())?;
        if !rest.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.map(ToString::to_string),
            args: arg_pairs
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (KString::from_ref(k), v.to_string()))
                .collect(),
        })
    }

    #[must_use]
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    /// Is a boolean-ish argument switched on?
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.arg(key), Some("1" | "true"))
    }

    /// A byte-count argument
    /// # Errors
    /// Fails if the argument is present but not an integer.
    pub fn size_arg(&self, key: &str) -> Result<Option<usize>, Error> {
        self.arg(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| Error::UriParse(format!("argument `{key}` is not a byte count")))
            })
            .transpose()
    }

    /// The downstream device behind a ControlHub gateway, from the
    /// `target=ip:port` argument
    /// # Errors
    /// Fails if the argument is missing or malformed.
    pub fn target(&self) -> Result<HubTarget, Error> {
        let raw = self
            .arg("target")
            .ok_or_else(|| Error::UriParse("a chtcp URI needs a `target=ip:port` argument".into()))?;
        let (ip, port) = raw
            .split_once(':')
            .ok_or_else(|| Error::UriParse(format!("target `{raw}` is not `ip:port`")))?;
        let ip = Ipv4Addr::from_str(ip)
            .map_err(|_| Error::UriParse(format!("target `{raw}` has a bad IP")))?;
        let port = port
            .parse()
            .map_err(|_| Error::UriParse(format!("target `{raw}` has a bad port")))?;
        Ok(HubTarget { ip, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal() {
        let uri = Uri::parse("ipbusudp-2.0://board0:50001").unwrap();
        assert_eq!(uri.scheme, Scheme::IpbusUdp);
        assert_eq!(uri.host, "board0");
        assert_eq!(uri.port, 50001);
        assert_eq!(uri.path, None);
        assert!(uri.args.is_empty());
    }

    #[test]
    fn test_full() {
        let uri =
            Uri::parse("chtcp-2.0://hub.example:10203/crate1?target=192.168.0.7:50001&pipeline=1")
                .unwrap();
        assert_eq!(uri.scheme, Scheme::ChTcp);
        assert_eq!(uri.host, "hub.example");
        assert_eq!(uri.port, 10203);
        assert_eq!(uri.path.as_deref(), Some("crate1"));
        assert!(uri.flag("pipeline"));
        let target = uri.target().unwrap();
        assert_eq!(target.ip, Ipv4Addr::new(192, 168, 0, 7));
        assert_eq!(target.port, 50001);
    }

    #[test]
    fn test_size_args() {
        let uri =
            Uri::parse("ipbustcp-2.0://dev:9999?max_send_size=700&max_reply_size=1400").unwrap();
        assert_eq!(uri.size_arg("max_send_size").unwrap(), Some(700));
        assert_eq!(uri.size_arg("max_reply_size").unwrap(), Some(1400));
        assert_eq!(uri.size_arg("absent").unwrap(), None);
    }

    #[test]
    fn test_bad_scheme() {
        assert!(matches!(
            Uri::parse("ipbusudp-1.3://board0:50001"),
            Err(Error::UriParse(_))
        ));
    }

    #[test]
    fn test_missing_port() {
        assert!(matches!(
            Uri::parse("ipbusudp-2.0://board0"),
            Err(Error::UriParse(_))
        ));
    }

    #[test]
    fn test_missing_target() {
        let uri = Uri::parse("chtcp-2.0://hub:10203").unwrap();
        assert!(matches!(uri.target(), Err(Error::UriParse(_))));
    }
}
