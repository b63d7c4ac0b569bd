use rand::seq::SliceRandom;
use rand::Rng;

// A consistent client identity used in place of the fixed CLI fingerprint
// when an account runs in ban-evasion mode. All six fields must agree with
// each other (a claude-cli UA always pairs with a Node runtime, a browser UA
// with a browser runtime, and so on).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub user_agent: String,
    pub package_version: String,
    pub os: String,
    pub arch: String,
    pub runtime: String,
    pub runtime_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Profile {
    ClaudeCli,
    Browser,
    Node,
    Mobile,
    Other,
}

const PROFILES: [Profile; 5] = [
    Profile::ClaudeCli,
    Profile::Browser,
    Profile::Node,
    Profile::Mobile,
    Profile::Other,
];

const DESKTOP_PLATFORMS: [(&str, &[&str]); 3] = [
    ("MacOS", &["x64", "arm64"]),
    ("Windows", &["x64"]),
    ("Linux", &["x64", "arm64"]),
];

pub fn random_fingerprint() -> Fingerprint {
    let mut rng = rand::thread_rng();
    let profile = *PROFILES.choose(&mut rng).expect("profile set is non-empty");
    match profile {
        Profile::ClaudeCli => claude_cli_fingerprint(&mut rng),
        Profile::Browser => browser_fingerprint(&mut rng),
        Profile::Node => node_fingerprint(&mut rng),
        Profile::Mobile => mobile_fingerprint(&mut rng),
        Profile::Other => other_fingerprint(&mut rng),
    }
}

fn desktop_platform(rng: &mut impl Rng) -> (String, String) {
    let (os, archs) = DESKTOP_PLATFORMS.choose(rng).expect("platform set");
    let arch = archs.choose(rng).expect("arch set");
    (os.to_string(), arch.to_string())
}

fn node_version(rng: &mut impl Rng) -> String {
    format!(
        "v{}.{}.{}",
        rng.gen_range(16..=23),
        rng.gen_range(0..=20),
        rng.gen_range(0..=15)
    )
}

fn stainless_package_version(rng: &mut impl Rng) -> String {
    format!("0.{}.{}", rng.gen_range(45..=62), rng.gen_range(0..=9))
}

fn claude_cli_fingerprint(rng: &mut impl Rng) -> Fingerprint {
    let (os, arch) = desktop_platform(rng);
    let cli_version = format!("1.0.{}", rng.gen_range(40..=120));
    Fingerprint {
        user_agent: format!("claude-cli/{} (external, cli)", cli_version),
        package_version: stainless_package_version(rng),
        os,
        arch,
        runtime: "node".to_string(),
        runtime_version: node_version(rng),
    }
}

fn browser_fingerprint(rng: &mut impl Rng) -> Fingerprint {
    let chrome_major = rng.gen_range(100..=129);
    let (os, arch) = desktop_platform(rng);
    let platform = match os.as_str() {
        "MacOS" => "Macintosh; Intel Mac OS X 10_15_7",
        "Windows" => "Windows NT 10.0; Win64; x64",
        _ => "X11; Linux x86_64",
    };
    Fingerprint {
        user_agent: format!(
            "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Safari/537.36",
            platform, chrome_major
        ),
        package_version: stainless_package_version(rng),
        os,
        arch,
        runtime: "browser".to_string(),
        runtime_version: format!("{}.0.0.0", chrome_major),
    }
}

fn node_fingerprint(rng: &mut impl Rng) -> Fingerprint {
    let (os, arch) = desktop_platform(rng);
    let version = node_version(rng);
    Fingerprint {
        user_agent: format!("node-fetch/2.{}.0 (+https://github.com/node-fetch/node-fetch)", rng.gen_range(6..=7)),
        package_version: stainless_package_version(rng),
        os,
        arch,
        runtime: "node".to_string(),
        runtime_version: version,
    }
}

fn mobile_fingerprint(rng: &mut impl Rng) -> Fingerprint {
    let ios_major = rng.gen_range(15..=18);
    let ios_minor = rng.gen_range(0..=6);
    Fingerprint {
        user_agent: format!(
            "Mozilla/5.0 (iPhone; CPU iPhone OS {}_{} like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148",
            ios_major, ios_minor
        ),
        package_version: stainless_package_version(rng),
        os: "iOS".to_string(),
        arch: "arm64".to_string(),
        runtime: "browser".to_string(),
        runtime_version: format!("{}.{}", ios_major, ios_minor),
    }
}

fn other_fingerprint(rng: &mut impl Rng) -> Fingerprint {
    let py_minor = rng.gen_range(9..=12);
    let requests_minor = rng.gen_range(28..=32);
    let (os, arch) = desktop_platform(rng);
    Fingerprint {
        user_agent: format!("python-requests/2.{}.0", requests_minor),
        package_version: stainless_package_version(rng),
        os,
        arch,
        runtime: "python".to_string(),
        runtime_version: format!("3.{}", py_minor),
    }
}
