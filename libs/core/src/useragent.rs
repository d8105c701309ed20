/// Device info sniffed from a user-agent string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub device_type: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
}

/// Coarse user-agent sniffing, enough for operator-facing session context.
pub fn parse_user_agent(user_agent: &str) -> DeviceInfo {
    if user_agent.is_empty() {
        return DeviceInfo::default();
    }
    let ua = user_agent.to_ascii_lowercase();

    let device_type = if ["mobile", "android", "iphone", "ipod"]
        .iter()
        .any(|m| ua.contains(m))
    {
        "mobile"
    } else if ua.contains("ipad") || ua.contains("tablet") {
        "tablet"
    } else {
        "desktop"
    };

    let browser = if ua.contains("firefox") {
        Some("Firefox")
    } else if ua.contains("edg") {
        Some("Edge")
    } else if ua.contains("chrome") {
        Some("Chrome")
    } else if ua.contains("safari") {
        Some("Safari")
    } else if ua.contains("opera") || ua.contains("opr") {
        Some("Opera")
    } else {
        None
    };

    // iOS must win over macOS, its UA also says "Mac OS X".
    let os = if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ipod") {
        Some("iOS")
    } else if ua.contains("android") {
        Some("Android")
    } else if ua.contains("windows") {
        Some("Windows")
    } else if ua.contains("mac os") || ua.contains("macos") {
        Some("macOS")
    } else if ua.contains("linux") {
        Some("Linux")
    } else {
        None
    };

    DeviceInfo {
        device_type: Some(device_type.to_string()),
        browser: browser.map(str::to_string),
        os: os.map(str::to_string),
    }
}
