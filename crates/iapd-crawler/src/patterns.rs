use once_cell::sync::Lazy;
use regex::Regex;

/// One named pattern of the battery.
///
/// The case-sensitivity flag is baked into the expression (`(?i)` prefix);
/// it is carried here so the catalog documents itself. `capture_group` names
/// the group whose text is the interesting payload, for patterns that
/// extract rather than tag.
pub struct NamedPattern {
    pub name: &'static str,
    /// Canonical string emitted when the pattern matches
    pub tag: &'static str,
    pub case_insensitive: bool,
    pub capture_group: Option<usize>,
    pub regex: Regex,
}

fn tag_pattern(name: &'static str, tag: &'static str, expr: &str) -> NamedPattern {
    NamedPattern {
        name,
        tag,
        case_insensitive: expr.starts_with("(?i)"),
        capture_group: None,
        regex: Regex::new(expr).expect("pattern catalog regex must compile"),
    }
}

/// **Pattern Catalog**
///
/// The process-wide battery of regular expressions the classifier applies to
/// brochure text, partitioned by category. Built once behind a `Lazy`; the
/// `regex` engine guarantees linear-time matching, so adversarial PDF text
/// cannot blow up a scan.
pub struct PatternCatalog {
    pub proxy_providers: Vec<NamedPattern>,
    pub class_action_providers: Vec<NamedPattern>,
    pub esg_providers: Vec<NamedPattern>,
    pub esg_language: Vec<NamedPattern>,
    pub email: Regex,
    pub email_context_compliance: Regex,
    pub email_context_proxy: Regex,
    pub email_context_brochure: Regex,
    pub email_context_item17: Regex,
    pub does_not_vote: Vec<NamedPattern>,
    pub custodians: Vec<NamedPattern>,
    pub version_id: NamedPattern,
}

/// Canonical marker stored when abstention language is detected.
pub const DOES_NOT_VOTE_MARKER: &str = "Does not vote";

pub static PATTERN_CATALOG: Lazy<PatternCatalog> = Lazy::new(|| PatternCatalog {
    proxy_providers: vec![
        tag_pattern(
            "proxy_iss_long",
            "ISS",
            r"(?i)Institutional\s+Shareholder\s+Services",
        ),
        // Bare acronym stays case sensitive: "iss" appears inside ordinary words.
        tag_pattern("proxy_iss_acronym", "ISS", r"\bISS\b"),
        tag_pattern("proxy_glass_lewis", "Glass Lewis", r"(?i)Glass[\s,]+Lewis"),
        tag_pattern("proxy_broadridge", "Broadridge", r"(?i)Broadridge"),
        tag_pattern("proxy_egan_jones", "Egan-Jones", r"(?i)Egan[\s-]*Jones"),
        tag_pattern("proxy_proxyvote", "ProxyVote", r"(?i)Proxy\s*Vote\b"),
        tag_pattern("proxy_proxy_insight", "Proxy Insight", r"(?i)Proxy\s+Insight"),
    ],
    class_action_providers: vec![
        tag_pattern(
            "ca_scas",
            "Securities Class Action Services",
            r"(?i)Securities\s+Class\s+Action\s+Services",
        ),
        tag_pattern(
            "ca_chicago_clearing",
            "Chicago Clearing",
            r"(?i)Chicago\s+Clearing",
        ),
        tag_pattern(
            "ca_frt",
            "Financial Recovery Technologies",
            r"(?i)Financial\s+Recovery\s+Technologies",
        ),
        tag_pattern("ca_battea", "Battea", r"(?i)Battea"),
        tag_pattern("ca_claimscompass", "ClaimsCompass", r"(?i)Claims\s*Compass"),
    ],
    esg_providers: vec![
        tag_pattern("esg_sustainalytics", "Sustainalytics", r"(?i)Sustainalytics"),
        tag_pattern("esg_msci", "MSCI ESG", r"(?i)MSCI\s+ESG"),
        tag_pattern("esg_iss_esg", "ISS ESG", r"(?i)ISS[\s-]+ESG"),
        tag_pattern("esg_bloomberg", "Bloomberg ESG", r"(?i)Bloomberg\s+ESG"),
        tag_pattern(
            "esg_morningstar",
            "Morningstar Sustainability",
            r"(?i)Morningstar\s+Sustainab",
        ),
        tag_pattern("esg_refinitiv", "Refinitiv ESG", r"(?i)Refinitiv\s+ESG"),
        tag_pattern("esg_reprisk", "RepRisk", r"(?i)RepRisk"),
        tag_pattern("esg_truvalue", "TruValue", r"(?i)Tru\s*Value\s+Labs?"),
    ],
    esg_language: vec![
        tag_pattern("esg_lang_factors", "ESG", r"(?i)\bESG\s+factors?\b"),
        tag_pattern(
            "esg_lang_long_form",
            "ESG",
            r"(?i)environmental,?\s+social,?\s+and\s+governance",
        ),
        tag_pattern(
            "esg_lang_sustainable",
            "ESG",
            r"(?i)sustainable\s+invest(ing|ment)",
        ),
        tag_pattern(
            "esg_lang_sri",
            "ESG",
            r"(?i)socially\s+responsible\s+invest(ing|ment)",
        ),
    ],
    email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
        .expect("email regex must compile"),
    email_context_compliance: Regex::new(
        r"(?i)chief\s+compliance\s+officer|compliance\s+(department|officer|team)|\bCCO\b",
    )
    .expect("compliance context regex must compile"),
    email_context_proxy: Regex::new(r"(?i)\bprox(y|ies)\b")
        .expect("proxy context regex must compile"),
    email_context_brochure: Regex::new(r"(?i)\bbrochure\b")
        .expect("brochure context regex must compile"),
    email_context_item17: Regex::new(r"(?i)\bitem\s*17\b")
        .expect("item 17 context regex must compile"),
    does_not_vote: vec![
        tag_pattern(
            "dnv_does_not",
            DOES_NOT_VOTE_MARKER,
            r"(?i)(does|do|will)\s+not\s+(generally\s+)?vote",
        ),
        tag_pattern(
            "dnv_declines",
            DOES_NOT_VOTE_MARKER,
            r"(?i)declines?\s+to\s+vote",
        ),
        tag_pattern(
            "dnv_no_authority",
            DOES_NOT_VOTE_MARKER,
            r"(?i)(no|not\s+accept)\s+(the\s+)?authority\s+to\s+vote",
        ),
    ],
    custodians: vec![
        tag_pattern("cust_schwab", "Charles Schwab", r"(?i)Charles\s+Schwab|\bSchwab\b"),
        tag_pattern("cust_fidelity", "Fidelity", r"(?i)Fidelity"),
        tag_pattern("cust_pershing", "Pershing", r"(?i)Pershing"),
        tag_pattern(
            "cust_td_ameritrade",
            "TD Ameritrade",
            r"(?i)TD\s+Ameritrade",
        ),
        tag_pattern(
            "cust_interactive_brokers",
            "Interactive Brokers",
            r"(?i)Interactive\s+Brokers",
        ),
    ],
    version_id: NamedPattern {
        name: "brochure_version_id",
        tag: "",
        case_insensitive: false,
        capture_group: Some(1),
        regex: Regex::new(r"BRCHR_VRSN_ID=(\d+)").expect("version id regex must compile"),
    },
});

impl PatternCatalog {
    /// Recover a brochure version id from a URL.
    pub fn version_id_from_url(&self, url: &str) -> Option<String> {
        let group = self.version_id.capture_group.unwrap_or(1);
        self.version_id
            .regex
            .captures(url)
            .and_then(|captures| captures.get(group))
            .map(|m| m.as_str().to_string())
    }
}
