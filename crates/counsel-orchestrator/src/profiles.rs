use crate::types::{AgentConfig, Capability, ExecutionParams};

/// The agent roster shipped with the firm's deployment, one agent per capability.
/// Used when the configuration file declares no agents.
pub fn default_agents() -> Vec<AgentConfig> {
    vec![
        content_creator(),
        social_poster(),
        review_responder(),
        lead_follow_up(),
        performance_analyst(),
        legal_update_monitor(),
        seo_optimizer(),
        website_updater(),
    ]
}

fn params(temperature: f32, max_tokens: u32) -> ExecutionParams {
    ExecutionParams {
        temperature,
        max_tokens,
        ..ExecutionParams::default()
    }
}

fn tools(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn content_creator() -> AgentConfig {
    let mut agent = AgentConfig::new(
        "content-creator",
        "Content Creator",
        Capability::ContentCreation,
        "0 9 * * *",
    )
    .with_max_concurrency(2)
    .with_priority(7)
    .with_params(params(0.7, 4000))
    .with_tools(tools(&["keyword_research", "draft_article", "publish_draft"]));
    agent.memory = true;
    agent.learning = true;
    agent
}

fn social_poster() -> AgentConfig {
    let mut agent = AgentConfig::new(
        "social-poster",
        "Social Media Poster",
        Capability::SocialPosting,
        "0 10,14,18 * * *",
    )
    .with_max_concurrency(2)
    .with_priority(6)
    .with_params(params(0.8, 1000))
    .with_tools(tools(&["trending_tags", "gmb_post", "schedule_post"]));
    agent.learning = true;
    agent
}

fn review_responder() -> AgentConfig {
    let mut agent = AgentConfig::new(
        "review-responder",
        "Review Responder",
        Capability::ReviewResponse,
        "*/30 * * * *",
    )
    .with_priority(8)
    .with_params(params(0.4, 800))
    .with_tools(tools(&["fetch_reviews", "reply_review"]));
    agent.memory = true;
    agent
}

fn lead_follow_up() -> AgentConfig {
    let mut agent = AgentConfig::new(
        "lead-follow-up",
        "Lead Follow-Up",
        Capability::LeadFollowUp,
        "*/15 * * * *",
    )
    .with_max_concurrency(3)
    .with_priority(10)
    .with_params(params(0.5, 1200))
    .with_tools(tools(&["recent_leads", "send_email", "send_sms", "crm_update"]))
    // A follow-up that misses its window is worse than none.
    .with_task_deadline_ms(10 * 60 * 1000);
    agent.memory = true;
    agent.learning = true;
    agent
}

fn performance_analyst() -> AgentConfig {
    AgentConfig::new(
        "performance-analyst",
        "Performance Analyst",
        Capability::PerformanceCheck,
        "0 * * * *",
    )
    .with_priority(4)
    .with_params(params(0.2, 1500))
    .with_tools(tools(&["traffic_report", "conversion_report"]))
}

fn legal_update_monitor() -> AgentConfig {
    let mut agent = AgentConfig::new(
        "legal-update-monitor",
        "Legal Update Monitor",
        Capability::LegalUpdate,
        "0 6 * * *",
    )
    .with_priority(5)
    .with_params(params(0.1, 3000))
    .with_tools(tools(&["statute_feed", "case_law_search"]));
    agent.memory = true;
    agent
}

fn seo_optimizer() -> AgentConfig {
    AgentConfig::new(
        "seo-optimizer",
        "SEO Optimizer",
        Capability::SeoOptimization,
        "0 2 * * *",
    )
    .with_priority(3)
    .with_params(params(0.3, 2000))
    .with_tools(tools(&["keyword_rankings", "meta_audit", "sitemap_check"]))
}

fn website_updater() -> AgentConfig {
    AgentConfig::new(
        "website-updater",
        "Website Updater",
        Capability::WebsiteUpdate,
        "0 3 * * SUN",
    )
    .with_priority(2)
    .with_params(params(0.5, 4000))
    .with_tools(tools(&["page_inventory", "update_page"]))
}
