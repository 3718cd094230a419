use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// ArcGIS layers known to back the public flood control map, tried in order.
pub const DEFAULT_LAYER_URLS: &[&str] = &[
    "https://services1.arcgis.com/IwZZTMxZCmAmFYvF/arcgis/rest/services/DPWH_Flood_Control_Projects/FeatureServer/0",
    "https://services1.arcgis.com/IwZZTMxZCmAmFYvF/arcgis/rest/services/FloodControl_Data_20250802_v6_corrected_coordinates_for_uploading/FeatureServer/0",
];
pub const DEFAULT_SITE_URL: &str = "https://sumbongsapangulo.ph";
pub const DEFAULT_AJAX_URL: &str = "https://sumbongsapangulo.ph/wp-admin/admin-ajax.php";
pub const DEFAULT_FALLBACK_URL: &str = "https://raw.githubusercontent.com/rukku/sumbongsapangulo.ph-datasets/main/flood_control_projects.geojson";

const RC_NAME: &str = ".floodfetchrc";

/// Fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Candidate feature layers, tried in order until one yields rows.
    pub layer_urls: Vec<String>,
    /// Public site hosting the listing; scanned for the ajax nonce.
    pub site_url: String,
    pub ajax_url: String,
    /// Explicit listing nonce; skips detection when set.
    pub nonce: Option<String>,
    pub fallback_url: String,
    pub out_dir: PathBuf,
    /// Earlier export used to fill gaps in listing rows; `None` looks in `out_dir`.
    pub enrich_csv: Option<PathBuf>,

    pub page_size: usize,
    pub listing_page_size: usize,
    pub max_pages: usize,

    pub retry_max: usize,
    pub retry_delay: Duration,
    pub retry_delay_max: Duration,
    pub throttle: Duration,
    pub timeout: Duration,
    /// Whether to verify TLS certificates.
    pub verify: bool,
    /// Allow one retry of the listing without TLS verification.
    pub allow_insecure_retry: bool,

    pub use_listing: bool,
    pub use_fallback: bool,
    pub force_fallback: bool,
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layer_urls: DEFAULT_LAYER_URLS.iter().map(|s| s.to_string()).collect(),
            site_url: DEFAULT_SITE_URL.to_string(),
            ajax_url: DEFAULT_AJAX_URL.to_string(),
            nonce: None,
            fallback_url: DEFAULT_FALLBACK_URL.to_string(),
            out_dir: PathBuf::from("data"),
            enrich_csv: None,
            page_size: 2000,
            listing_page_size: 200,
            max_pages: 1000,
            retry_max: 4,
            retry_delay: Duration::from_secs(1),
            retry_delay_max: Duration::from_secs(30),
            throttle: Duration::from_millis(200),
            timeout: Duration::from_secs(60),
            verify: true,
            allow_insecure_retry: true,
            use_listing: true,
            use_fallback: true,
            force_fallback: false,
            progress: true,
        }
    }
}

/// Values supplied on the command line; `None` defers to env, rc file, then defaults.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub layer_urls: Vec<String>,
    pub out_dir: Option<PathBuf>,
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
    pub force_fallback: bool,
    pub no_fallback: bool,
    pub no_listing: bool,
    pub no_progress: bool,
}

#[derive(Debug, Default)]
struct RcConfig {
    layer_urls: Vec<String>,
    site_url: Option<String>,
    ajax_url: Option<String>,
    nonce: Option<String>,
    fallback_url: Option<String>,
    out_dir: Option<String>,
    enrich_csv: Option<String>,
    page_size: Option<String>,
    verify: Option<bool>,
}

pub fn load_config(overrides: Overrides) -> Result<Config> {
    load_config_with(overrides, |name| std::env::var(name).ok())
}

/// [`load_config`] reading variables through `lookup` instead of the process environment.
fn load_config_with<L>(overrides: Overrides, lookup: L) -> Result<Config>
where
    L: Fn(&str) -> Option<String>,
{
    let env = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    let mut rc = RcConfig::default();
    for rc_path in rc_candidates(env("FLOODFETCH_RC")) {
        if rc_path.exists() {
            rc = read_rc(&rc_path).with_context(|| {
                format!("failed to read configuration file {}", rc_path.display())
            })?;
            tracing::debug!(path = %rc_path.display(), "loaded rc file");
            break;
        }
    }

    let mut cfg = Config::default();

    let env_layers = env("FLOODFETCH_LAYER_URL").map(|v| split_list(&v));
    if !overrides.layer_urls.is_empty() {
        cfg.layer_urls = overrides.layer_urls;
    } else if let Some(layers) = env_layers.filter(|l| !l.is_empty()) {
        cfg.layer_urls = layers;
    } else if !rc.layer_urls.is_empty() {
        cfg.layer_urls = rc.layer_urls;
    }

    if let Some(v) = rc.site_url {
        cfg.site_url = v;
    }
    if let Some(v) = env("FLOODFETCH_AJAX_URL").or(rc.ajax_url) {
        cfg.ajax_url = v;
    }
    cfg.nonce = env("FLOODFETCH_NONCE").or(rc.nonce);
    if let Some(v) = env("FLOODFETCH_FALLBACK_URL").or(rc.fallback_url) {
        cfg.fallback_url = v;
    }

    if let Some(dir) = overrides
        .out_dir
        .or_else(|| env("FLOODFETCH_OUT_DIR").or(rc.out_dir).map(PathBuf::from))
    {
        cfg.out_dir = dir;
    }
    cfg.enrich_csv = env("FLOODFETCH_ENRICH_CSV").or(rc.enrich_csv).map(PathBuf::from);

    let page_size = match overrides.page_size {
        Some(n) => Some(n),
        None => match env("FLOODFETCH_PAGE_SIZE").or(rc.page_size) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<usize>()
                    .with_context(|| format!("invalid page size `{}`", raw))?,
            ),
            None => None,
        },
    };
    if let Some(n) = page_size {
        if n == 0 {
            bail!("page size must be at least 1");
        }
        cfg.page_size = n;
    }
    if let Some(n) = overrides.max_pages {
        if n == 0 {
            bail!("max pages must be at least 1");
        }
        cfg.max_pages = n;
    }

    if let Some(v) = rc.verify {
        cfg.verify = v;
    }

    cfg.force_fallback = overrides.force_fallback;
    cfg.use_fallback = !overrides.no_fallback;
    cfg.use_listing = !overrides.no_listing;
    cfg.progress = !overrides.no_progress;

    if cfg.force_fallback && !cfg.use_fallback {
        bail!("--force-fallback and --no-fallback are mutually exclusive");
    }
    if cfg.layer_urls.is_empty() && !cfg.use_fallback && !cfg.use_listing {
        bail!("Missing configuration: no layer_url and every fallback disabled");
    }

    Ok(cfg)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_rc(path: &Path) -> Result<RcConfig> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_rc(&text))
}

fn parse_rc(text: &str) -> RcConfig {
    let mut cfg = RcConfig::default();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once(':') else {
            continue;
        };
        let v = strip_quotes(v.trim());
        if v.is_empty() {
            continue;
        }
        match k.trim() {
            "layer_url" => cfg.layer_urls.push(v.to_string()),
            "site_url" => cfg.site_url = Some(v.to_string()),
            "ajax_url" => cfg.ajax_url = Some(v.to_string()),
            "nonce" => cfg.nonce = Some(v.to_string()),
            "fallback_url" => cfg.fallback_url = Some(v.to_string()),
            "out_dir" => cfg.out_dir = Some(v.to_string()),
            "enrich_csv" => cfg.enrich_csv = Some(v.to_string()),
            "page_size" => cfg.page_size = Some(v.to_string()),
            "verify" => cfg.verify = Some(v != "0"),
            _ => {}
        }
    }

    cfg
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn rc_candidates(explicit: Option<String>) -> Vec<PathBuf> {
    // 1) FLOODFETCH_RC (explicit)
    // 2) ./.floodfetchrc
    // 3) ~/.floodfetchrc
    if let Some(p) = explicit {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(RC_NAME));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(RC_NAME));
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn rc_accepts_comments_quotes_and_repeated_layers() {
        let rc = parse_rc(
            "# mirror layers\n\
             layer_url: https://a/FeatureServer/0\n\
             layer_url: 'https://b/FeatureServer/0'\n\
             fallback_url: \"https://c/data.geojson\"\n\
             page_size: 500\n\
             verify: 0\n\
             unknown: ignored\n",
        );
        assert_eq!(
            rc.layer_urls,
            vec!["https://a/FeatureServer/0", "https://b/FeatureServer/0"]
        );
        assert_eq!(rc.fallback_url.as_deref(), Some("https://c/data.geojson"));
        assert_eq!(rc.page_size.as_deref(), Some("500"));
        assert_eq!(rc.verify, Some(false));
    }

    #[test]
    fn url_values_keep_their_scheme_colon() {
        let rc = parse_rc("ajax_url: https://example.org/wp-admin/admin-ajax.php");
        assert_eq!(
            rc.ajax_url.as_deref(),
            Some("https://example.org/wp-admin/admin-ajax.php")
        );
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(split_list(" a , ,b"), vec!["a", "b"]);
    }

    #[test]
    fn strip_quotes_leaves_lone_quote() {
        assert_eq!(strip_quotes("\""), "\"");
        assert_eq!(strip_quotes("'x'"), "x");
    }

    struct Fixture {
        dir: tempfile::TempDir,
        vars: HashMap<&'static str, String>,
    }

    impl Fixture {
        /// Points `FLOODFETCH_RC` at a file in a scratch dir; `rc` of `None` leaves it absent.
        fn new(rc: Option<&str>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("floodfetchrc");
            if let Some(text) = rc {
                std::fs::write(&path, text).unwrap();
            }
            let mut vars = HashMap::new();
            vars.insert("FLOODFETCH_RC", path.display().to_string());
            Self { dir, vars }
        }

        fn set(mut self, name: &'static str, value: &str) -> Self {
            self.vars.insert(name, value.to_string());
            self
        }

        fn load(&self, overrides: Overrides) -> Result<Config> {
            load_config_with(overrides, |name| self.vars.get(name).cloned())
        }
    }

    const RC: &str = "layer_url: https://rc/FeatureServer/0\n\
                      out_dir: rc-out\n\
                      page_size: 500\n\
                      fallback_url: https://rc/p.geojson\n\
                      enrich_csv: rc-cleaned.csv\n";

    #[test]
    fn defaults_apply_without_rc_env_or_flags() {
        let fx = Fixture::new(None);
        let cfg = fx.load(Overrides::default()).unwrap();
        assert_eq!(cfg.layer_urls, DEFAULT_LAYER_URLS);
        assert_eq!(cfg.page_size, 2000);
        assert_eq!(cfg.out_dir, PathBuf::from("data"));
        assert_eq!(cfg.fallback_url, DEFAULT_FALLBACK_URL);
        assert_eq!(cfg.enrich_csv, None);
        assert!(cfg.use_listing && cfg.use_fallback && !cfg.force_fallback);
        assert!(fx.dir.path().exists());
    }

    #[test]
    fn rc_file_overrides_defaults() {
        let cfg = Fixture::new(Some(RC)).load(Overrides::default()).unwrap();
        assert_eq!(cfg.layer_urls, vec!["https://rc/FeatureServer/0"]);
        assert_eq!(cfg.out_dir, PathBuf::from("rc-out"));
        assert_eq!(cfg.page_size, 500);
        assert_eq!(cfg.fallback_url, "https://rc/p.geojson");
        assert_eq!(cfg.enrich_csv, Some(PathBuf::from("rc-cleaned.csv")));
    }

    #[test]
    fn environment_overrides_rc_file() {
        let cfg = Fixture::new(Some(RC))
            .set("FLOODFETCH_LAYER_URL", "https://env/a/0, https://env/b/0")
            .set("FLOODFETCH_OUT_DIR", "env-out")
            .set("FLOODFETCH_PAGE_SIZE", "700")
            .set("FLOODFETCH_FALLBACK_URL", "https://env/p.geojson")
            .load(Overrides::default())
            .unwrap();
        assert_eq!(cfg.layer_urls, vec!["https://env/a/0", "https://env/b/0"]);
        assert_eq!(cfg.out_dir, PathBuf::from("env-out"));
        assert_eq!(cfg.page_size, 700);
        assert_eq!(cfg.fallback_url, "https://env/p.geojson");
    }

    #[test]
    fn flags_override_environment() {
        let fx = Fixture::new(Some(RC))
            .set("FLOODFETCH_LAYER_URL", "https://env/a/0")
            .set("FLOODFETCH_OUT_DIR", "env-out")
            .set("FLOODFETCH_PAGE_SIZE", "700");
        let cfg = fx
            .load(Overrides {
                layer_urls: vec!["https://cli/FeatureServer/0".into()],
                out_dir: Some(PathBuf::from("cli-out")),
                page_size: Some(50),
                max_pages: Some(3),
                no_listing: true,
                no_progress: true,
                ..Overrides::default()
            })
            .unwrap();
        assert_eq!(cfg.layer_urls, vec!["https://cli/FeatureServer/0"]);
        assert_eq!(cfg.out_dir, PathBuf::from("cli-out"));
        assert_eq!(cfg.page_size, 50);
        assert_eq!(cfg.max_pages, 3);
        assert!(!cfg.use_listing);
        assert!(!cfg.progress);
    }

    #[test]
    fn blank_environment_values_are_ignored() {
        let cfg = Fixture::new(Some(RC))
            .set("FLOODFETCH_PAGE_SIZE", "  ")
            .set("FLOODFETCH_LAYER_URL", " , ")
            .load(Overrides::default())
            .unwrap();
        assert_eq!(cfg.page_size, 500);
        assert_eq!(cfg.layer_urls, vec!["https://rc/FeatureServer/0"]);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let fx = Fixture::new(None);
        let zero_page = Overrides {
            page_size: Some(0),
            ..Overrides::default()
        };
        assert!(fx.load(zero_page).is_err());

        let zero_pages = Overrides {
            max_pages: Some(0),
            ..Overrides::default()
        };
        assert!(fx.load(zero_pages).is_err());

        let conflicting = Overrides {
            force_fallback: true,
            no_fallback: true,
            ..Overrides::default()
        };
        let err = fx.load(conflicting).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));

        let bad_env = Fixture::new(None).set("FLOODFETCH_PAGE_SIZE", "many");
        let err = bad_env.load(Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("invalid page size"));
    }
}
