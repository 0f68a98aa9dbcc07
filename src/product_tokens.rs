//! `<OS>/<OS-version> UPnP/<1.0|1.1> <Product>/<Product-version>` tokens (§6.3), used as
//! the value of the `SERVER` and `USER-AGENT` headers.

use std::{borrow::Cow, fmt::Display, str::FromStr};

/// One `name/version` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductToken<'a> {
    pub name: Cow<'a, str>,
    pub version: Cow<'a, str>,
}

impl<'a> ProductToken<'a> {
    pub fn new(name: impl Into<Cow<'a, str>>, version: impl Into<Cow<'a, str>>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.version.trim().is_empty()
    }
}

impl Display for ProductToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

impl<'a> ProductToken<'a> {
    /// Parses one token out of the comma-delimited `SERVER`/`USER-AGENT` variant a
    /// handful of peers emit in place of the space-delimited triple.
    ///
    /// Mirrors the original parser's `tmp[i].left(index)` / `tmp[i].right(index)` split,
    /// which takes the slash itself plus everything after it as the version instead of
    /// `mid(index+1)` (everything strictly after the slash). Some peers that emit this
    /// comma-delimited form compensate for the same off-by-one on their receiving end, so
    /// "fixing" it here would break compatibility with them; kept as specified, not
    /// corrected, per the open question in the distilled spec.
    pub fn parse_comma_delimited(token: &'a str) -> Option<Self> {
        let index = token.find('/')?;
        let name = &token[..index];
        let version = &token[index..];
        Some(Self::new(name, version))
    }
}

/// The three required tokens (`OS/ver UPnP/ver Product/ver`) plus any trailing vendor
/// tokens, in the order they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpAgent<'a> {
    pub os: ProductToken<'a>,
    pub upnp: ProductToken<'a>,
    pub product: ProductToken<'a>,
    pub extra: Vec<ProductToken<'a>>,
}

impl<'a> UpnpAgent<'a> {
    pub fn new(
        os: ProductToken<'a>,
        upnp_version: &'a str,
        product: ProductToken<'a>,
    ) -> Self {
        Self {
            os,
            upnp: ProductToken::new("UPnP", upnp_version),
            product,
            extra: Vec::new(),
        }
    }

    pub fn is_valid_upnp_token(token: &ProductToken) -> bool {
        token.name == "UPnP"
            && matches!(token.version.as_ref(), "1.0" | "1.1")
    }

    pub fn into_owned(self) -> UpnpAgent<'static> {
        UpnpAgent {
            os: ProductToken::new(self.os.name.into_owned(), self.os.version.into_owned()),
            upnp: ProductToken::new(self.upnp.name.into_owned(), self.upnp.version.into_owned()),
            product: ProductToken::new(
                self.product.name.into_owned(),
                self.product.version.into_owned(),
            ),
            extra: self
                .extra
                .into_iter()
                .map(|t| ProductToken::new(t.name.into_owned(), t.version.into_owned()))
                .collect(),
        }
    }
}

impl Display for UpnpAgent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.os, self.upnp, self.product)?;
        for extra in &self.extra {
            write!(f, " {extra}")?;
        }
        Ok(())
    }
}

impl FromStr for UpnpAgent<'static> {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace().map(|raw| {
            let (name, version) = raw
                .split_once('/')
                .ok_or_else(|| anyhow::anyhow!("token {raw} lacks a version"))?;
            anyhow::ensure!(!version.trim().is_empty(), "token {raw} has empty version");
            Ok::<_, anyhow::Error>(ProductToken::new(name.to_owned(), version.to_owned()))
        });
        let os = tokens.next().ok_or_else(|| anyhow::anyhow!("missing OS token"))??;
        let upnp = tokens.next().ok_or_else(|| anyhow::anyhow!("missing UPnP token"))??;
        anyhow::ensure!(
            UpnpAgent::is_valid_upnp_token(&upnp),
            "second token must be UPnP/1.0 or UPnP/1.1, got {upnp}"
        );
        let product = tokens.next().ok_or_else(|| anyhow::anyhow!("missing product token"))??;
        let extra = tokens.collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            os,
            upnp,
            product,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_as_three_space_separated_tokens() {
        let agent = UpnpAgent::new(ProductToken::new("Linux", "5.15"), "1.1", ProductToken::new("upnp-stack", "0.1"));
        assert_eq!(agent.to_string(), "Linux/5.15 UPnP/1.1 upnp-stack/0.1");
    }

    #[test]
    fn parses_back_the_required_triple() {
        let agent: UpnpAgent = "Linux/5.15 UPnP/1.1 upnp-stack/0.1".parse().unwrap();
        assert_eq!(agent.os.name, "Linux");
        assert_eq!(agent.upnp.version, "1.1");
        assert_eq!(agent.product.name, "upnp-stack");
    }

    #[test]
    fn rejects_non_upnp_second_token() {
        let result: anyhow::Result<UpnpAgent> = "Linux/5.15 Other/1.1 upnp-stack/0.1".parse();
        assert!(result.is_err());
    }

    #[test]
    fn comma_delimited_quirk_keeps_the_slash_on_the_version_side() {
        let parsed = ProductToken::parse_comma_delimited("UPnP/1.0").unwrap();
        assert_eq!(parsed.name, "UPnP");
        assert_eq!(parsed.version, "/1.0");
    }
}
