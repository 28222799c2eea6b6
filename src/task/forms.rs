//! Page scraping and request payloads.
//!
//! Scraping is regex based: the storefront pages are machine generated and
//! only a handful of attributes matter (input names and values, the captcha
//! sitekey, the checkout step, the storefront token).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use url::form_urlencoded;

use super::state::State;
use crate::model::{Account, Address, Payment, Profile};

macro_rules! re {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| {
            #[allow(clippy::expect_used)]
            Regex::new($pattern).expect("literal pattern")
        });
    };
}

re!(FORM, r#"(?is)<form\b([^>]*)>(.*?)</form>"#);
re!(INPUT, r#"(?is)<input\b[^>]*>"#);
re!(NAME_ATTR, r#"(?i)\bname\s*=\s*"([^"]*)""#);
re!(VALUE_ATTR, r#"(?i)\bvalue\s*=\s*"([^"]*)""#);
re!(HASH_NAME, r"[a-fA-F0-9]{32}");
re!(SITEKEY, r#"(?i)(?:data-sitekey="|[?&]k=)([\w-]+)"#);
re!(STEP, r#"Shopify\.Checkout\.step\s*=\s*"([^"]*)""#);
re!(TOKEN_META, r#"(?i)<meta\s*name="shopify-checkout-api-token"\s*content="([^"]*)""#);
re!(TOKEN_JSON, r#""accessToken"\s*:\s*"([^"]*)""#);
re!(HREF, r#"href="([^"]*)""#);
re!(CHECKOUT_URL, r"/(\d+)/checkouts/([A-Za-z0-9]+)");
re!(CART_BLACKLIST, r"^(undefined|null|q|g|gender|\$fields|email|subscribe|updates\[.*:.*\])$");
re!(CART_VALUE_BLACKLIST, r"(?i)^(update cart|update|\{\{itemQty\}\})$");
re!(SHIPPING_METHOD, r#"data-shipping-method="([^"]+)""#);
re!(CAPTCHA, r"(?i)g-recaptcha|h-captcha|captcha-error");
re!(GATEWAY, r#"(?i)name="checkout\[payment_gateway\]"[^>]*value="(\d+)""#);

/// Ordered form fields.
pub type Fields = Vec<(String, String)>;

fn decode(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// `name`/`value` of every `<input>` in `html`, in document order.
pub fn inputs(html: &str) -> Fields {
    INPUT
        .find_iter(html)
        .filter_map(|tag| {
            let tag = tag.as_str();
            let name = NAME_ATTR.captures(tag)?.get(1)?.as_str();
            let value = VALUE_ATTR
                .captures(tag)
                .and_then(|c| c.get(1))
                .map_or(String::new(), |v| decode(v.as_str()));
            Some((decode(name), value))
        })
        .collect()
}

/// Inputs of the first form whose opening tag contains `needle`, or `None`.
pub fn form_inputs(html: &str, needle: &str) -> Option<Fields> {
    let needle = needle.to_ascii_lowercase();
    FORM.captures_iter(html)
        .find(|c| c[1].to_ascii_lowercase().contains(&needle))
        .map(|c| inputs(&c[2]))
}

pub fn encode(fields: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

/// Sets `name`, or inserts it right after `after` (at the end if `after` is absent).
pub fn upsert_after(fields: &mut Fields, after: &str, name: &str, value: &str) {
    if let Some(slot) = fields.iter_mut().find(|(k, _)| k == name) {
        slot.1 = value.to_string();
        return;
    }
    let at = fields
        .iter()
        .position(|(k, _)| k == after)
        .map_or(fields.len(), |i| i + 1);
    fields.insert(at, (name.to_string(), value.to_string()));
}

pub fn sitekey(html: &str) -> Option<String> {
    SITEKEY.captures(html).map(|c| c[1].to_string())
}

/// Value of `Shopify.Checkout.step`.
pub fn checkout_step(html: &str) -> Option<String> {
    STEP.captures(html).map(|c| c[1].to_string())
}

/// Storefront access token from the meta tag, then from inline JSON.
pub fn access_token(html: &str) -> Option<String> {
    TOKEN_META
        .captures(html)
        .or_else(|| TOKEN_JSON.captures(html))
        .map(|c| c[1].to_string())
        .filter(|t| !t.is_empty())
}

/// First `href` pointing at a checkout.
pub fn checkout_href(html: &str) -> Option<String> {
    HREF.captures_iter(html)
        .map(|c| decode(&c[1]))
        .find(|h| h.contains("checkouts"))
}

/// `(store id, checkout hash)` from a checkout URL.
pub fn checkout_ids(url: &str) -> Option<(String, String)> {
    CHECKOUT_URL
        .captures(url)
        .map(|c| (c[1].to_string(), c[2].to_string()))
}

/// Value of the `_ctd` query parameter.
pub fn queue_cursor(url: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "_ctd")
        .map(|(_, v)| v.into_owned())
}

/// First shipping rate offered on the shipping step.
pub fn shipping_method(html: &str) -> Option<String> {
    SHIPPING_METHOD.captures(html).map(|c| decode(&c[1]))
}

/// The page asks for a captcha.
pub fn wants_captcha(html: &str) -> bool {
    CAPTCHA.is_match(html)
}

pub fn payment_gateway(html: &str) -> Option<String> {
    GATEWAY.captures(html).map(|c| c[1].to_string())
}

/// Cart form minus the fields the cart page must not receive back.
pub fn cart_form(html: &str) -> Fields {
    let fields = form_inputs(html, "/cart").unwrap_or_else(|| inputs(html));
    fields
        .into_iter()
        .filter(|(k, v)| !CART_BLACKLIST.is_match(k) && !CART_VALUE_BLACKLIST.is_match(v))
        .collect()
}

/// Checkpoint form without a stale captcha response.
pub fn checkpoint_form(html: &str) -> Fields {
    let fields = form_inputs(html, "checkpoint").unwrap_or_else(|| inputs(html));
    fields
        .into_iter()
        .filter(|(k, _)| k != "g-recaptcha-response")
        .collect()
}

/// Scraped checkout step form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutForm {
    pub fields: Fields,
    /// The page carries hashed anti-bot fields; the form must be echoed back.
    pub protected: bool,
}

fn profile_value(name: &str, profile: &Profile) -> Option<String> {
    fn address(field: &str, a: &Address) -> Option<String> {
        Some(match field {
            "first_name" => a.first_name.clone(),
            "last_name" => a.last_name.clone(),
            "address1" => a.address.clone(),
            "address2" => a.apt.clone(),
            "city" => a.city.clone(),
            "country" => a.country.label.clone(),
            "province" => a.province_code().to_string(),
            "zip" => a.zip.clone(),
            "phone" => a.phone.clone(),
            _ => return None,
        })
    }

    if name == "checkout[email]" || name == "checkout[email_or_phone]" {
        return Some(profile.payment.email.clone());
    }
    let field = |prefix: &str| {
        name.strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(']'))
            .map(str::to_string)
    };
    if let Some(f) = field("checkout[shipping_address][") {
        return address(&f, &profile.shipping);
    }
    if let Some(f) = field("checkout[billing_address][") {
        return address(&f, profile.billing());
    }
    None
}

fn client_details(fields: &mut Fields, width: u32, height: u32) {
    let details = [
        ("browser_width", width.to_string()),
        ("browser_height", height.to_string()),
        ("javascript_enabled", "1".to_string()),
        ("color_depth", "24".to_string()),
        ("java_enabled", "false".to_string()),
        ("browser_tz", "240".to_string()),
    ];
    for (k, v) in details {
        fields.push((format!("checkout[client_details][{k}]"), v));
    }
}

/// Scrapes the checkout form for `state`, filling in profile values.
pub fn checkout_form(html: &str, state: State, hash: &str, profile: &Profile) -> CheckoutForm {
    let raw = form_inputs(html, "checkout").unwrap_or_else(|| inputs(html));
    let mut fields = Fields::new();
    let mut hashed = 0usize;
    let has = |fields: &Fields, needle: &str| fields.iter().any(|(k, _)| k.contains(needle));

    for (name, value) in raw {
        if name.is_empty() || name.contains("recaptcha") {
            continue;
        }
        if HASH_NAME.is_match(&name) {
            hashed += 1;
        }
        if name == "s" {
            fields.push((name, String::new()));
            continue;
        }
        if name.contains("different_billing_address") {
            if !has(&fields, "different_billing_address") {
                fields.push((name, (!profile.billing_matches()).to_string()));
            }
            continue;
        }
        if profile.billing_matches()
            && name.contains("billing_address")
            && has(&fields, "shipping_address")
        {
            continue;
        }
        if name.contains("button") && (state == State::GoToPayment || has(&fields, "button")) {
            continue;
        }
        if name.contains("shipping_rate") && has(&fields, "shipping_rate") {
            continue;
        }
        if name.contains("field_end") {
            fields.push((format!("{hash}-count"), hashed.to_string()));
            continue;
        }
        if name.contains("hosted_fields_redirect") || name.contains("field_start") {
            continue;
        }
        if name.contains("payment_gateway")
            && (value.contains("free") || has(&fields, "payment_gateway"))
        {
            continue;
        }
        let value = profile_value(&name, profile).unwrap_or(value);
        fields.push((name, value));
    }

    if !has(&fields, "client_details") {
        client_details(&mut fields, 1238, 453);
    }

    CheckoutForm {
        fields,
        protected: hashed > 0,
    }
}

pub fn login_form(account: &Account) -> String {
    encode(&[
        ("form_type".into(), "customer_login".into()),
        ("utf8".into(), "✓".into()),
        ("customer[email]".into(), account.username.clone()),
        ("customer[password]".into(), account.password.clone()),
        ("return_url".into(), "/account".into()),
    ])
}

fn address_fields(fields: &mut Fields, prefix: &str, a: &Address) {
    let values = [
        ("first_name", a.first_name.as_str()),
        ("last_name", a.last_name.as_str()),
        ("company", ""),
        ("address1", a.address.as_str()),
        ("address2", a.apt.as_str()),
        ("city", a.city.as_str()),
        ("country", a.country.label.as_str()),
        ("province", a.province_code()),
        ("zip", a.zip.as_str()),
        ("phone", a.phone.as_str()),
    ];
    for (k, v) in values {
        fields.push((format!("checkout[{prefix}][{k}]"), v.to_string()));
    }
}

fn base_fields(previous: &str, step: &str) -> Fields {
    vec![
        ("_method".into(), "patch".into()),
        ("authenticity_token".into(), String::new()),
        ("previous_step".into(), previous.into()),
        ("step".into(), step.into()),
    ]
}

/// Contact information step.
pub fn contact_form(profile: &Profile, captcha: Option<&str>) -> String {
    let mut fields = base_fields("contact_information", "shipping_method");
    fields.push(("checkout[email]".into(), profile.payment.email.clone()));
    address_fields(&mut fields, "shipping_address", &profile.shipping);
    fields.push(("checkout[remember_me]".into(), "0".into()));
    if let Some(token) = captcha {
        fields.push(("g-recaptcha-response".into(), token.into()));
    }
    client_details(&mut fields, 1238, 453);
    encode(&fields)
}

/// Shipping method step.
pub fn shipping_form(rate_id: &str) -> String {
    let mut fields = base_fields("shipping_method", "payment_method");
    fields.push(("checkout[shipping_rate][id]".into(), rate_id.into()));
    fields.push(("button".into(), String::new()));
    fields.push(("checkout[client_details][browser_width]".into(), "927".into()));
    fields.push(("checkout[client_details][browser_height]".into(), "967".into()));
    fields.push(("checkout[client_details][javascript_enabled]".into(), "1".into()));
    encode(&fields)
}

/// Payment method step, paying with the vaulted session `s`.
pub fn payment_form(profile: &Profile, s: &str, gateway: &str) -> String {
    let mut fields = base_fields("payment_method", "");
    fields.push(("s".into(), s.into()));
    fields.push(("checkout[payment_gateway]".into(), gateway.into()));
    fields.push(("checkout[credit_card][vault]".into(), "false".into()));
    fields.push((
        "checkout[different_billing_address]".into(),
        (!profile.billing_matches()).to_string(),
    ));
    address_fields(&mut fields, "billing_address", profile.billing());
    fields.push(("checkout[total_price]".into(), String::new()));
    fields.push(("complete".into(), "1".into()));
    client_details(&mut fields, 1238, 453);
    encode(&fields)
}

/// Review step.
pub fn complete_form(captcha: Option<&str>) -> String {
    let mut fields = base_fields("review", "");
    fields.push(("complete".into(), "1".into()));
    if let Some(token) = captcha {
        fields.push(("g-recaptcha-response".into(), token.into()));
    }
    encode(&fields)
}

fn wallet_address(a: &Address) -> Value {
    json!({
        "first_name": a.first_name,
        "last_name": a.last_name,
        "address1": a.address,
        "address2": a.apt,
        "city": a.city,
        "country": a.country.value,
        "province": a.province_code(),
        "state": a.province_code(),
        "zip": a.zip,
        "phone": a.phone,
    })
}

/// Wallet checkout patch carrying the customer.
pub fn wallet_customer(profile: &Profile, captcha: Option<&str>) -> Value {
    let mut body = json!({
        "complete": "1",
        "checkout": {
            "secret": true,
            "email": profile.payment.email,
            "shipping_address": wallet_address(&profile.shipping),
            "billing_address": wallet_address(profile.billing()),
        },
    });
    if let (Some(token), Some(map)) = (captcha, body.as_object_mut()) {
        map.insert("g-recaptcha-response".into(), token.into());
    }
    body
}

/// Wallet checkout patch submitting the payment.
pub fn wallet_payment(s: &str, rate_id: Option<&str>, captcha: Option<&str>) -> Value {
    let mut body = json!({ "complete": 1, "s": s });
    if let Some(map) = body.as_object_mut() {
        if let Some(id) = rate_id {
            map.insert("checkout".into(), json!({ "shipping_rate": { "id": id } }));
        }
        if let Some(token) = captcha {
            map.insert("g-recaptcha-response".into(), token.into());
        }
    }
    body
}

/// Card payload posted to the payment vault.
pub fn card_session(payment: &Payment, name: &str) -> Option<Value> {
    let (month, year) = payment.expiry()?;
    Some(json!({
        "credit_card": {
            "number": payment.card_number,
            "name": name,
            "month": month,
            "year": year,
            "verification_value": payment.cvv,
        }
    }))
}

/// Query for `/cart/shipping_rates.json`.
pub fn rates_query(address: &Address) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair("shipping_address[zip]", &address.zip)
        .append_pair("shipping_address[country]", &address.country.label)
        .append_pair("shipping_address[province]", address.province_code())
        .finish()
}
