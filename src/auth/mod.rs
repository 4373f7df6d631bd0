//! Authentication material for platforms that need a logged-in session.
//!
//! Bundles use the Netscape cookie-jar format that browsers and browser
//! extensions export.

mod cookies;
mod store;

pub use cookies::{CookieError, CookieLine, load_cookies_into_jar, parse_cookie_jar};
pub use store::{CookieBundle, CookieBundleInfo, CookieStore, CookieStoreError, bundle_file_name};
