use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://data.cityofnewyork.us/resource/nc67-uf89.json";
pub const DEFAULT_CAPTCHA_BASE_URL: &str = "https://2captcha.com";
pub const DEFAULT_PROXY_PROBE_URL: &str = "http://httpbin.org/ip";

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    // Open Data API
    pub api_base_url: String,
    pub api_timeout: Duration,
    /// 1分あたりのリクエスト上限
    pub requests_per_minute: u32,
    pub page_size: usize,
    /// ページ取得間の待機
    pub page_pause: Duration,

    // 2Captcha
    pub captcha_api_key: Option<String>,
    pub captcha_base_url: String,
    pub captcha_timeout: Duration,
    pub captcha_poll_interval: Duration,

    // プロキシ
    pub proxies: Vec<String>,
    pub proxy_check_interval: Duration,
    pub proxy_probe_url: String,
    pub proxy_probe_timeout: Duration,

    // NYCServ スクレイピング
    pub max_enhance: usize,
    pub download_path: PathBuf,
    pub headless: bool,
    pub browser_timeout: Duration,
    pub chrome_path: Option<String>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_timeout: Duration::from_secs(30),
            requests_per_minute: 100,
            page_size: 1000,
            page_pause: Duration::from_millis(100),
            captcha_api_key: None,
            captcha_base_url: DEFAULT_CAPTCHA_BASE_URL.to_string(),
            captcha_timeout: Duration::from_secs(300),
            captcha_poll_interval: Duration::from_secs(5),
            proxies: Vec::new(),
            proxy_check_interval: Duration::from_secs(60),
            proxy_probe_url: DEFAULT_PROXY_PROBE_URL.to_string(),
            proxy_probe_timeout: Duration::from_secs(10),
            max_enhance: 50,
            download_path: PathBuf::from("./downloads"),
            headless: true,
            browser_timeout: Duration::from_millis(30_000),
            chrome_path: None,
        }
    }
}

impl AcquisitionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 環境変数から設定を読み込む
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意のキー参照関数から設定を構築（未設定・解析不能な値はデフォルトのまま）
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = get("NYC_API_BASE_URL") {
            config.api_base_url = url;
        }
        if let Some(secs) = get("NYC_API_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            config.api_timeout = Duration::from_secs(secs);
        }
        if let Some(rpm) = get("API_RATE_LIMIT").and_then(|v| v.parse::<u32>().ok()) {
            if rpm > 0 {
                config.requests_per_minute = rpm;
            }
        }
        config.captcha_api_key = get("CAPTCHA_API_KEY");
        if let Some(secs) = get("CAPTCHA_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            config.captcha_timeout = Duration::from_secs(secs);
        }
        if let Some(list) = get("PROXY_LIST") {
            config.proxies = list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(max) = get("MAX_SCRAPE_VIOLATIONS").and_then(|v| v.parse::<usize>().ok()) {
            config.max_enhance = max;
        }
        if let Some(ms) = get("BROWSER_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            config.browser_timeout = Duration::from_millis(ms);
        }
        if let Some(dir) = get("DOWNLOADS_DIR") {
            config.download_path = PathBuf::from(dir);
        }
        if let Some(headless) = get("HEADLESS") {
            config.headless = !matches!(headless.to_ascii_lowercase().as_str(), "0" | "false" | "no");
        }
        config.chrome_path = get("CHROME_PATH").or_else(|| get("CHROMIUM_PATH"));

        config
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm.max(1);
        self
    }

    pub fn with_captcha_api_key(mut self, key: impl Into<String>) -> Self {
        self.captcha_api_key = Some(key.into());
        self
    }

    pub fn with_captcha_timeout(mut self, timeout: Duration) -> Self {
        self.captcha_timeout = timeout;
        self
    }

    pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_enhance(mut self, max: usize) -> Self {
        self.max_enhance = max;
        self
    }

    pub fn with_download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = path.into();
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_browser_timeout(mut self, timeout: Duration) -> Self {
        self.browser_timeout = timeout;
        self
    }

    /// 空白だけのキーは未設定扱い
    pub fn has_captcha_key(&self) -> bool {
        self.captcha_api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn has_proxies(&self) -> bool {
        !self.proxies.is_empty()
    }

    /// リクエスト間の最小間隔 (60 / requests_per_minute 秒)
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / f64::from(self.requests_per_minute.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AcquisitionConfig::default();
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.requests_per_minute, 100);
        assert_eq!(config.captcha_poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_enhance, 50);
        assert!(!config.has_captcha_key());
        assert!(!config.has_proxies());
    }

    #[test]
    fn test_from_lookup() {
        let config = AcquisitionConfig::from_lookup(lookup_from(&[
            ("API_RATE_LIMIT", "30"),
            ("CAPTCHA_API_KEY", "abc123"),
            ("CAPTCHA_TIMEOUT", "120"),
            ("PROXY_LIST", "10.0.0.1:8080, ,http://u:p@10.0.0.2:3128"),
            ("MAX_SCRAPE_VIOLATIONS", "5"),
            ("DOWNLOADS_DIR", "/tmp/violations"),
            ("HEADLESS", "false"),
            ("CHROMIUM_PATH", "/usr/bin/chromium"),
        ]));

        assert_eq!(config.requests_per_minute, 30);
        assert!(config.has_captcha_key());
        assert_eq!(config.captcha_timeout, Duration::from_secs(120));
        assert_eq!(
            config.proxies,
            vec!["10.0.0.1:8080".to_string(), "http://u:p@10.0.0.2:3128".to_string()]
        );
        assert_eq!(config.max_enhance, 5);
        assert_eq!(config.download_path, PathBuf::from("/tmp/violations"));
        assert!(!config.headless);
        assert_eq!(config.chrome_path.as_deref(), Some("/usr/bin/chromium"));
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let config = AcquisitionConfig::from_lookup(lookup_from(&[
            ("API_RATE_LIMIT", "fast"),
            ("CAPTCHA_API_KEY", "   "),
            ("BROWSER_TIMEOUT", "-1"),
        ]));

        assert_eq!(config.requests_per_minute, 100);
        assert!(config.captcha_api_key.is_none());
        assert_eq!(config.browser_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn test_blank_key_is_not_configured() {
        let config = AcquisitionConfig::new().with_captcha_api_key("  ");
        assert!(!config.has_captcha_key());
    }

    #[test]
    fn test_min_request_interval() {
        let config = AcquisitionConfig::new().with_requests_per_minute(120);
        assert_eq!(config.min_request_interval(), Duration::from_millis(500));
    }
}
