use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;

use ircgate_gateway::SessionConfig;
use ircgate_remote::Credentials;

const DEFAULT_TOKEN_FILE: &str = "~/.localslackirc";

#[derive(Debug, Parser)]
#[command(name = "ircgate", version, about = "IRC gateway to a Slack workspace")]
pub struct Cli {
    /// Port to listen on for the IRC client.
    #[arg(short, long, env = "PORT", default_value_t = 9007)]
    pub port: u16,

    /// Address to listen on.
    #[arg(short, long, env = "IP_ADDRESS", default_value = "127.0.0.1")]
    pub ip: String,

    /// Allow listening on a non-local address. Anybody reaching it can use
    /// the account.
    #[arg(short = 'o', long = "override", env = "OVERRIDE_LOCAL_IP")]
    pub override_local_ip: bool,

    /// File holding the token on its first line.
    #[arg(short, long, default_value = DEFAULT_TOKEN_FILE)]
    pub tokenfile: String,

    /// Token. Takes precedence over the token file.
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File holding the `d` cookie, needed by browser-session tokens.
    #[arg(short, long)]
    pub cookiefile: Option<PathBuf>,

    /// Cookie. Takes precedence over the cookie file.
    #[arg(long, env = "COOKIE", hide_env_values = true)]
    pub cookie: Option<String>,

    /// Never send member lists.
    #[arg(short = 'u', long, env = "NOUSERLIST")]
    pub nouserlist: bool,

    /// Join every remote channel when the client registers.
    #[arg(short = 'j', long, env = "AUTOJOIN")]
    pub autojoin: bool,

    /// Where to keep the last seen timestamp between runs.
    #[arg(short = 'f', long, env = "STATUS_FILE")]
    pub status_file: Option<PathBuf>,

    /// Server name used in numeric replies.
    #[arg(long, env = "IRCGATE_HOSTNAME", default_value = "localhost")]
    pub hostname: String,

    /// Tag added to every log line, to tell instances apart.
    #[arg(long, env = "LOG_SUFFIX", default_value = "")]
    pub log_suffix: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub credentials: Credentials,
    pub status_file: Option<PathBuf>,
    pub session: SessionConfig,
    pub log_suffix: String,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let ip: IpAddr = cli
            .ip
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.ip))?;
        if !ip.is_loopback() && !cli.override_local_ip {
            bail!("refusing to listen on non-local address {} without --override", ip);
        }

        let token = match cli.token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => read_first_line(&expand_home(&cli.tokenfile))?,
        };
        let cookie = match cli.cookie.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()) {
            Some(cookie) => Some(cookie),
            None => cli.cookiefile.as_deref().map(read_first_line).transpose()?,
        };
        if token.starts_with("xoxc-") && cookie.is_none() {
            bail!("xoxc- tokens need the d cookie, pass --cookiefile or set COOKIE");
        }

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(ip, cli.port),
            credentials: Credentials { token, cookie },
            status_file: cli.status_file,
            session: SessionConfig {
                hostname: cli.hostname,
                autojoin: cli.autojoin,
                nouserlist: cli.nouserlist,
            },
            log_suffix: cli.log_suffix,
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

fn read_first_line(path: &Path) -> anyhow::Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    let line = content.lines().next().unwrap_or_default().trim();
    if line.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["ircgate", "--token", "xoxb-test"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("ircgate-{}-{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn defaults_listen_locally() {
        let config = ServerConfig::try_from(cli(&[])).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9007".parse().unwrap());
        assert_eq!(config.session.hostname, "localhost");
        assert!(!config.session.autojoin);
        assert_eq!(config.credentials.token, "xoxb-test");
    }

    #[test]
    fn public_address_needs_override() {
        let err = ServerConfig::try_from(cli(&["--ip", "0.0.0.0"])).unwrap_err();
        assert!(err.to_string().contains("non-local"));

        let config = ServerConfig::try_from(cli(&["--ip", "0.0.0.0", "--override"])).unwrap();
        assert_eq!(config.listen_addr.port(), 9007);
    }

    #[test]
    fn browser_token_needs_cookie() {
        let args = ["ircgate", "--token", "xoxc-abc"];
        let err = ServerConfig::try_from(Cli::try_parse_from(args).unwrap()).unwrap_err();
        assert!(err.to_string().contains("cookie"));

        let cookie = temp_file("cookie", "xoxd-secret\n");
        let cookie_arg = cookie.to_string_lossy().into_owned();
        let args = ["ircgate", "--token", "xoxc-abc", "--cookiefile", &cookie_arg];
        let config = ServerConfig::try_from(Cli::try_parse_from(args).unwrap()).unwrap();
        assert_eq!(config.credentials.cookie.as_deref(), Some("xoxd-secret"));
        std::fs::remove_file(cookie).unwrap();
    }

    #[test]
    fn token_file_first_line() {
        let file = temp_file("token", "  xoxb-from-file \nignored\n");
        let file_arg = file.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from(["ircgate", "--tokenfile", &file_arg]).unwrap();
        // An inherited TOKEN variable would win over the file.
        if cli.token.is_none() {
            let config = ServerConfig::try_from(cli).unwrap();
            assert_eq!(config.credentials.token, "xoxb-from-file");
        }
        std::fs::remove_file(file).unwrap();
    }

    #[test]
    fn home_is_expanded() {
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/.tok"), Path::new(&home).join(".tok"));
        }
        assert_eq!(expand_home("/etc/tok"), PathBuf::from("/etc/tok"));
    }
}
