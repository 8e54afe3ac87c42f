//! Demo workflow: a simulated social-profile analysis.
//!
//! The steps stand in for the scraping, vision and analysis clients a real
//! feature would call; they sleep briefly and return canned data. Run-time
//! knobs travel in the workflow context so a resumed instance behaves like
//! the original run:
//!
//! - `handle` (required): profile to analyse
//! - `banner_url` (optional): enables the banner branch, skipped otherwise
//! - `fail_at` (optional): step ID that fails permanently, to trigger rollback
//! - `mode`, `timeout_secs` (optional): the [`DemoOptions`] the run was built with

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sagaflow_core::workflow::context::WorkflowContext;
use sagaflow_core::workflow::definition::{WorkflowDefinition, WorkflowError};
use sagaflow_core::workflow::retry::RetryPolicy;
use sagaflow_core::workflow::step::{CompensationAction, Step, StepError, StepExt};
use sagaflow_types::workflow::ExecutionMode;

pub const WORKFLOW_NAME: &str = "profile-analysis";

/// Definition-level knobs for the demo.
#[derive(Debug, Clone, Default)]
pub struct DemoOptions {
    pub mode: ExecutionMode,
    pub global_timeout: Option<Duration>,
}

impl DemoOptions {
    /// Store the options in the run's context.
    pub fn record(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        ctx.put("mode", &self.mode)?;
        if let Some(timeout) = self.global_timeout {
            ctx.put("timeout_secs", &timeout.as_secs())?;
        }
        Ok(())
    }

    /// Options recorded by [`DemoOptions::record`]; defaults for absent keys.
    pub fn from_context(ctx: &WorkflowContext) -> Result<Self, StepError> {
        Ok(Self {
            mode: ctx.get("mode")?.unwrap_or_default(),
            global_timeout: ctx.get::<u64>("timeout_secs")?.map(Duration::from_secs),
        })
    }
}

/// Build the profile-analysis definition.
///
/// ```text
/// reserve-quota ─┐
///                ├─ analyze-headline ─────────────────┐
/// fetch-profile ─┤                                    ├─ create-report ─ notify-owner
///                └─ fetch-banner ─ analyze-banner ────┘
/// ```
pub fn profile_analysis(options: &DemoOptions) -> Result<WorkflowDefinition, WorkflowError> {
    let mut builder = WorkflowDefinition::builder(WORKFLOW_NAME)
        .description("Fetch a social profile, analyse it and publish a report")
        .execution_mode(options.mode)
        .add_step(ReserveQuota)
        .add_step(FetchProfile)
        .add_step_after(FetchBanner, &["fetch-profile"])
        .add_step_after(AnalyzeBanner, &["fetch-banner"])
        .add_step_after(AnalyzeHeadline::default(), &["fetch-profile"])
        .add_step_after(
            CreateReport.with_compensation(DiscardReport),
            &["reserve-quota", "analyze-headline", "analyze-banner"],
        )
        .add_step_after(NotifyOwner, &["create-report"]);
    if let Some(timeout) = options.global_timeout {
        builder = builder.global_timeout(timeout);
    }
    builder.build()
}

/// Initial context for a demo run.
pub fn demo_context(
    handle: &str,
    banner_url: Option<&str>,
    fail_at: Option<&str>,
) -> Result<WorkflowContext, StepError> {
    let mut ctx = WorkflowContext::new();
    ctx.put("handle", handle)?;
    if let Some(url) = banner_url {
        ctx.put("banner_url", url)?;
    }
    if let Some(step_id) = fail_at {
        ctx.put("fail_at", step_id)?;
    }
    Ok(ctx)
}

fn check_injected_failure(ctx: &WorkflowContext, step_id: &str) -> Result<(), StepError> {
    match ctx.get::<String>("fail_at")? {
        Some(target) if target == step_id => Err(StepError::permanent(format!(
            "injected failure at '{step_id}'"
        ))),
        _ => Ok(()),
    }
}

async fn simulate_latency(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub units: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub handle: String,
    pub display_name: String,
    pub headline: String,
    pub followers: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Banner {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BannerAnalysis {
    pub dominant_color: String,
    pub has_text: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadlineAnalysis {
    pub keywords: Vec<String>,
    pub tone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub report_id: String,
    pub score: u32,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: String,
    pub delivered: bool,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

struct ReserveQuota;

impl Step for ReserveQuota {
    type Input = String;
    type Output = Reservation;

    fn id(&self) -> &str {
        "reserve-quota"
    }

    fn name(&self) -> &str {
        "Reserve analysis quota"
    }

    fn output_key(&self) -> Option<&str> {
        Some("reservation")
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<String, StepError> {
        check_injected_failure(ctx, self.id())?;
        Ok(ctx.get_required("handle")?)
    }

    async fn execute(&self, handle: String, _ctx: &WorkflowContext) -> Result<Reservation, StepError> {
        simulate_latency(50).await;
        Ok(Reservation {
            reservation_id: format!("quota-{handle}"),
            units: 3,
        })
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn compensate(&self, output: Reservation, _ctx: &WorkflowContext) -> Result<(), StepError> {
        simulate_latency(20).await;
        tracing::info!(
            reservation_id = %output.reservation_id,
            units = output.units,
            "released analysis quota"
        );
        Ok(())
    }
}

struct FetchProfile;

impl Step for FetchProfile {
    type Input = String;
    type Output = Profile;

    fn id(&self) -> &str {
        "fetch-profile"
    }

    fn name(&self) -> &str {
        "Fetch profile"
    }

    fn output_key(&self) -> Option<&str> {
        Some("profile")
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(3, Duration::from_millis(200)).with_max_delay(Duration::from_secs(2))
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<String, StepError> {
        check_injected_failure(ctx, self.id())?;
        Ok(ctx.get_required("handle")?)
    }

    async fn execute(&self, handle: String, _ctx: &WorkflowContext) -> Result<Profile, StepError> {
        simulate_latency(150).await;
        Ok(Profile {
            display_name: handle.replace(['-', '_'], " "),
            headline: "Building reliable distributed systems in Rust".to_string(),
            followers: 1_250 + handle.len() as u64 * 37,
            handle,
        })
    }
}

struct FetchBanner;

impl Step for FetchBanner {
    type Input = String;
    type Output = Banner;

    fn id(&self) -> &str {
        "fetch-banner"
    }

    fn name(&self) -> &str {
        "Fetch banner image"
    }

    fn output_key(&self) -> Option<&str> {
        Some("banner")
    }

    fn should_skip(&self, ctx: &WorkflowContext) -> bool {
        !ctx.contains_key("banner_url")
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<String, StepError> {
        check_injected_failure(ctx, self.id())?;
        Ok(ctx.get_required("banner_url")?)
    }

    async fn execute(&self, url: String, _ctx: &WorkflowContext) -> Result<Banner, StepError> {
        simulate_latency(200).await;
        Ok(Banner {
            url,
            width: 1584,
            height: 396,
        })
    }
}

struct AnalyzeBanner;

impl Step for AnalyzeBanner {
    type Input = Banner;
    type Output = BannerAnalysis;

    fn id(&self) -> &str {
        "analyze-banner"
    }

    fn name(&self) -> &str {
        "Analyse banner"
    }

    fn output_key(&self) -> Option<&str> {
        Some("banner_analysis")
    }

    fn should_skip(&self, ctx: &WorkflowContext) -> bool {
        !ctx.contains_key("banner")
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<Banner, StepError> {
        check_injected_failure(ctx, self.id())?;
        Ok(ctx.get_required("banner")?)
    }

    async fn execute(&self, banner: Banner, _ctx: &WorkflowContext) -> Result<BannerAnalysis, StepError> {
        simulate_latency(250).await;
        Ok(BannerAnalysis {
            dominant_color: "#1d3557".to_string(),
            has_text: banner.width > banner.height,
        })
    }
}

/// Rejects every other request, like a rate-limited analysis service.
#[derive(Default)]
struct AnalyzeHeadline {
    calls: AtomicU32,
}

impl Step for AnalyzeHeadline {
    type Input = Profile;
    type Output = HeadlineAnalysis;

    fn id(&self) -> &str {
        "analyze-headline"
    }

    fn name(&self) -> &str {
        "Analyse headline"
    }

    fn output_key(&self) -> Option<&str> {
        Some("headline_analysis")
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(100))
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<Profile, StepError> {
        check_injected_failure(ctx, self.id())?;
        Ok(ctx.get_required("profile")?)
    }

    async fn execute(&self, profile: Profile, _ctx: &WorkflowContext) -> Result<HeadlineAnalysis, StepError> {
        simulate_latency(100).await;
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(StepError::failed("analysis service busy"));
        }
        let keywords = profile
            .headline
            .split_whitespace()
            .filter(|word| word.len() > 4)
            .map(str::to_lowercase)
            .collect();
        Ok(HeadlineAnalysis {
            keywords,
            tone: "professional".to_string(),
        })
    }
}

struct CreateReport;

struct ReportInput {
    profile: Profile,
    headline: HeadlineAnalysis,
    banner: Option<BannerAnalysis>,
}

impl Step for CreateReport {
    type Input = ReportInput;
    type Output = Report;

    fn id(&self) -> &str {
        "create-report"
    }

    fn name(&self) -> &str {
        "Create report"
    }

    fn output_key(&self) -> Option<&str> {
        Some("report")
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<ReportInput, StepError> {
        check_injected_failure(ctx, self.id())?;
        Ok(ReportInput {
            profile: ctx.get_required("profile")?,
            headline: ctx.get_required("headline_analysis")?,
            banner: ctx.get("banner_analysis")?,
        })
    }

    async fn execute(&self, input: ReportInput, _ctx: &WorkflowContext) -> Result<Report, StepError> {
        simulate_latency(80).await;
        let mut score = 40 + (input.headline.keywords.len() as u32 * 10).min(40);
        if input.banner.as_ref().is_some_and(|b| b.has_text) {
            score += 20;
        }
        Ok(Report {
            report_id: format!("report-{}", input.profile.handle),
            score,
            summary: format!(
                "{} ({} followers): {} tone, keywords {}",
                input.profile.display_name,
                input.profile.followers,
                input.headline.tone,
                input.headline.keywords.join(", ")
            ),
        })
    }
}

/// Deletes the stored report draft.
struct DiscardReport;

impl CompensationAction<Report> for DiscardReport {
    async fn compensate(&self, report: Report, _ctx: &WorkflowContext) -> Result<(), StepError> {
        simulate_latency(20).await;
        tracing::info!(report_id = %report.report_id, "discarded report draft");
        Ok(())
    }
}

struct NotifyOwner;

impl Step for NotifyOwner {
    type Input = (String, Report);
    type Output = Notification;

    fn id(&self) -> &str {
        "notify-owner"
    }

    fn name(&self) -> &str {
        "Notify owner"
    }

    fn output_key(&self) -> Option<&str> {
        Some("notification")
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<(String, Report), StepError> {
        check_injected_failure(ctx, self.id())?;
        Ok((ctx.get_required("handle")?, ctx.get_required("report")?))
    }

    async fn execute(
        &self,
        (handle, report): (String, Report),
        _ctx: &WorkflowContext,
    ) -> Result<Notification, StepError> {
        simulate_latency(60).await;
        tracing::debug!(report_id = %report.report_id, "sending report notification");
        Ok(Notification {
            recipient: handle,
            delivered: true,
        })
    }
}
