use clap::Parser;

/// Energy Bridge - SunSpec inverters, meters and batteries plus Modbus wallboxes
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// YAML config file
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Stop after this many seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    /// Log level, overriding the one in the config file
    #[clap(short = 'l', long = "loglevel")]
    pub loglevel: Option<String>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }

    /// Level to run at: the command line wins over the config file.
    pub fn loglevel<'a>(&'a self, configured: &'a str) -> &'a str {
        self.loglevel.as_deref().unwrap_or(configured)
    }
}
