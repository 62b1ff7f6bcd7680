//! Rendering of the nginx site configuration.
//!
//! The template is a fixed asset with `{{KEY}}` placeholders, one per
//! environment key. Rendering is a single left-to-right pass over the
//! template, so values are inserted verbatim and never rescanned.

use std::collections::BTreeMap;

const SITE_TEMPLATE: &str = include_str!("../templates/nginx_site.conf");

pub fn render_site_config(env: &BTreeMap<String, String>) -> String {
    render(SITE_TEMPLATE, env)
}

/// Unknown placeholders are left in place.
pub fn render(template: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        match env.get(&after[..end]) {
            Some(value) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
