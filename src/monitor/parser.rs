//! Product parsers.
//!
//! A [`ParserFactory`] hands the monitor a list of [`Parser`]s for a matcher.
//! The monitor races them: the first `Ok` wins and the others are dropped.

use async_trait::async_trait;
use futures::future::select_ok;
use serde::Deserialize;
use serde_json::Value;

use super::matcher::ProductMatcher;
use super::product::{Product, Variant};
use crate::error::ParseError;
use crate::http::{HttpRequest, HttpSession};
use crate::model::{Platform, Store};

/// Resolves a matcher into a product.
#[async_trait]
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        session: &dyn HttpSession,
        store: &Store,
        matcher: &ProductMatcher,
    ) -> Result<Product, ParseError>;
}

/// Chooses the parsers to race for a matcher.
pub trait ParserFactory: Send + Sync + 'static {
    fn parsers(&self, platform: Platform, matcher: &ProductMatcher) -> Vec<Box<dyn Parser>>;
}

/// Runs every parser concurrently; first success wins, the last failure is returned otherwise.
pub async fn race(
    parsers: &[Box<dyn Parser>],
    session: &dyn HttpSession,
    store: &Store,
    matcher: &ProductMatcher,
) -> Result<Product, ParseError> {
    if parsers.is_empty() {
        return Err(ParseError::Unsupported { parser: "none" });
    }
    let runs = parsers.iter().map(|p| p.run(session, store, matcher));
    match select_ok(runs).await {
        Ok((product, _rest)) => Ok(product),
        Err(last) => Err(last),
    }
}

/// Default factory: [`JsonParser`] for every matcher it supports.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultParsers;

impl ParserFactory for DefaultParsers {
    fn parsers(&self, _platform: Platform, _matcher: &ProductMatcher) -> Vec<Box<dyn Parser>> {
        vec![Box::new(JsonParser)]
    }
}

/// Storefront JSON endpoints: `/products.json` for keywords, `<url>.js` for URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonParser;

#[derive(Deserialize)]
struct ProductsPage {
    #[serde(default)]
    products: Vec<RawProduct>,
}

#[derive(Deserialize)]
struct RawProduct {
    id: Value,
    title: String,
    #[serde(default)]
    handle: String,
    #[serde(default)]
    featured_image: Option<String>,
    #[serde(default)]
    images: Vec<RawImage>,
    #[serde(default)]
    variants: Vec<RawVariant>,
}

#[derive(Deserialize)]
struct RawImage {
    src: String,
}

#[derive(Deserialize)]
struct RawVariant {
    id: Value,
    #[serde(default)]
    title: String,
    #[serde(default)]
    option1: Option<String>,
    #[serde(default)]
    option2: Option<String>,
    #[serde(default)]
    option3: Option<String>,
    #[serde(default)]
    available: Option<bool>,
    #[serde(default)]
    price: Value,
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl RawProduct {
    fn into_product(self, base: &str) -> Result<Product, ParseError> {
        if self.variants.is_empty() {
            return Err(ParseError::Placeholder);
        }
        let image = self
            .featured_image
            .or_else(|| self.images.into_iter().next().map(|i| i.src))
            .map(|src| match src.strip_prefix("//") {
                Some(rest) => format!("https://{rest}"),
                None => src,
            });
        Ok(Product {
            id: text(&self.id),
            url: format!("{base}/products/{}", self.handle),
            handle: self.handle,
            title: self.title,
            image,
            variants: self
                .variants
                .into_iter()
                .map(|v| Variant {
                    id: text(&v.id),
                    options: [v.option1, v.option2, v.option3].into_iter().flatten().collect(),
                    title: v.title,
                    available: v.available.unwrap_or(true),
                    price: text(&v.price),
                })
                .collect(),
        })
    }
}

impl JsonParser {
    async fn fetch(session: &dyn HttpSession, target: String) -> Result<String, ParseError> {
        let res = session.send(HttpRequest::get(target)).await?;
        if res.location.as_deref().is_some_and(|l| l.contains("password")) || res.status == 401 {
            return Err(ParseError::Password);
        }
        if !res.is_success() {
            return Err(ParseError::Status { status: res.status });
        }
        Ok(res.body)
    }
}

#[async_trait]
impl Parser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn run(
        &self,
        session: &dyn HttpSession,
        store: &Store,
        matcher: &ProductMatcher,
    ) -> Result<Product, ParseError> {
        let base = store.base();
        match matcher {
            ProductMatcher::Variant { id } => Ok(Product {
                id: id.clone(),
                title: format!("Variant {id}"),
                handle: String::new(),
                url: base.to_string(),
                image: None,
                variants: vec![Variant {
                    id: id.clone(),
                    title: String::new(),
                    options: Vec::new(),
                    available: true,
                    price: String::new(),
                }],
            }),
            ProductMatcher::Url { url } => {
                let url = url.split('?').next().unwrap_or_default().trim_end_matches('/');
                let body = Self::fetch(session, format!("{url}.js")).await?;
                let raw: RawProduct =
                    serde_json::from_str(&body).map_err(|e| ParseError::Malformed(e.to_string()))?;
                raw.into_product(base)
            }
            ProductMatcher::Keywords { .. } => {
                let body = Self::fetch(session, "/products.json?limit=250".to_string()).await?;
                let page: ProductsPage =
                    serde_json::from_str(&body).map_err(|e| ParseError::Malformed(e.to_string()))?;
                let found = page
                    .products
                    .into_iter()
                    .find(|p| matcher.matches_title(&p.title))
                    .ok_or(ParseError::NotFound)?;
                found.into_product(base)
            }
            ProductMatcher::Special { .. } => Err(ParseError::Unsupported {
                parser: self.name(),
            }),
        }
    }
}
