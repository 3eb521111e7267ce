use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

/// Which variant or representation to pick when a manifest offers several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    #[default]
    Best,
    Worst,
    /// Highest bandwidth not above the given bits per second.
    MaxBandwidth(u64),
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" | "highest" => Ok(Quality::Best),
            "worst" | "lowest" => Ok(Quality::Worst),
            other => parse_bandwidth(other)
                .map(Quality::MaxBandwidth)
                .ok_or_else(|| {
                    format!("invalid quality `{s}`: expected best, worst or a bandwidth like 2500k")
                }),
        }
    }
}

/// `2500000`, `2500k` or `2.5m`.
fn parse_bandwidth(s: &str) -> Option<u64> {
    let (digits, multiplier) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 1_000.0),
        b'm' => (&s[..s.len() - 1], 1_000_000.0),
        _ => (s, 1.0),
    };
    let value: f64 = digits.parse().ok()?;
    (value.is_finite() && value > 0.0).then(|| (value * multiplier) as u64)
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Download HLS, DASH and progressive media", long_about = None)]
pub struct Args {
    /// Manifest or media URL
    pub url: String,

    /// Directory for the final output
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Directory for segment files (defaults to the output directory)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Output file name without extension
    #[arg(short, long)]
    pub name: Option<String>,

    /// Concurrent downloads
    #[arg(short = 't', long, default_value_t = 8)]
    pub threads: usize,

    /// Retries per segment after the first attempt
    #[arg(short, long, default_value_t = 3)]
    pub retries: u32,

    /// Retry failed segments until cancelled
    #[arg(long, conflicts_with = "retries")]
    pub retry_forever: bool,

    /// Pause between retries, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub retry_wait: u64,

    /// Pause between two task launches, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub launch_delay: u64,

    /// Proxy URL, e.g. socks5://127.0.0.1:1080
    #[arg(long)]
    pub proxy: Option<String>,

    /// Extra request header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Re-download files that already exist
    #[arg(long)]
    pub overwrite: bool,

    /// best, worst or a bandwidth ceiling such as 2500k
    #[arg(short, long, default_value = "best")]
    pub quality: Quality,

    /// Preferred audio language
    #[arg(long)]
    pub lang: Option<String>,

    /// Skip malformed manifest entries instead of failing
    #[arg(long)]
    pub lenient: bool,

    /// Keep segment files instead of merging them
    #[arg(long)]
    pub no_merge: bool,

    /// Print the download plan as JSON and exit
    #[arg(long)]
    pub dump_plan: bool,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(long)]
    pub quiet: bool,
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid header `{s}`: expected \"Name: value\""))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid header `{s}`: empty name"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_parsing() {
        assert_eq!("best".parse::<Quality>(), Ok(Quality::Best));
        assert_eq!("Worst".parse::<Quality>(), Ok(Quality::Worst));
        assert_eq!(
            "2500k".parse::<Quality>(),
            Ok(Quality::MaxBandwidth(2_500_000))
        );
        assert_eq!(
            "1.5m".parse::<Quality>(),
            Ok(Quality::MaxBandwidth(1_500_000))
        );
        assert_eq!("800000".parse::<Quality>(), Ok(Quality::MaxBandwidth(800_000)));
        assert!("fast".parse::<Quality>().is_err());
        assert!("0".parse::<Quality>().is_err());
    }

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["segfetch", "https://example.com/index.m3u8"]).unwrap();
        assert_eq!(args.threads, 8);
        assert_eq!(args.retries, 3);
        assert_eq!(args.quality, Quality::Best);
        assert!(args.headers.is_empty());
        assert!(!args.retry_forever);
    }

    #[test]
    fn repeated_headers() {
        let args = Args::try_parse_from([
            "segfetch",
            "https://example.com/manifest.mpd",
            "-H",
            "Referer: https://example.com/",
            "--header",
            "Cookie:a=b; c=d",
            "-q",
            "worst",
        ])
        .unwrap();
        assert_eq!(
            args.headers,
            vec![
                ("Referer".to_string(), "https://example.com/".to_string()),
                ("Cookie".to_string(), "a=b; c=d".to_string()),
            ]
        );
        assert_eq!(args.quality, Quality::Worst);
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(
            Args::try_parse_from(["segfetch", "https://example.com/a", "-H", "no-colon"]).is_err()
        );
    }

    #[test]
    fn retry_forever_conflicts_with_retries() {
        assert!(
            Args::try_parse_from([
                "segfetch",
                "https://example.com/a",
                "--retry-forever",
                "--retries",
                "2"
            ])
            .is_err()
        );
    }
}
