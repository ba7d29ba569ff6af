//! Pipeline definitions.
//!
//! A pipeline is a fixed, ordered list of named steps. Each step owns its
//! retry policy and an action that turns the previous step's output into
//! its own. The standard pipeline is capture -> transform -> publish -> notify.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::adapters::{
    Document, DocumentPublisher, DocumentTemplate, DocumentTransformer, Notifier, Receipt,
    ThreadCapture, ThreadContent, ThreadRef,
};
use crate::domain::{codes, WorkflowError, WorkflowRun};

pub const STEP_CAPTURE: &str = "capture";
pub const STEP_TRANSFORM: &str = "transform";
pub const STEP_PUBLISH: &str = "publish";
pub const STEP_NOTIFY: &str = "notify";

/// Run-level facts a step may need besides its input
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    pub template_id: Option<String>,
}

impl StepContext {
    pub fn for_run(run: &WorkflowRun, step_name: &str) -> Self {
        Self {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            step_name: step_name.to_string(),
            template_id: run.template_id.clone(),
        }
    }
}

/// The work behind one pipeline step.
///
/// `execute` may be invoked several times for one step (retries), so it
/// borrows its input instead of consuming it.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, ctx: &StepContext, input: &Value) -> Result<Value>;
}

/// A named step with its own retry policy
#[derive(Clone)]
pub struct PipelineStep {
    pub name: String,
    pub retry_policy: RetryPolicy,
    pub action: Arc<dyn StepAction>,
}

impl PipelineStep {
    pub fn new(name: impl Into<String>, retry_policy: RetryPolicy, action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.into(),
            retry_policy,
            action,
        }
    }
}

impl std::fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStep")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// A complete pipeline definition
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name (matches `WorkflowRun::workflow_name`)
    pub name: String,

    /// Ordered list of steps to execute
    pub steps: Vec<PipelineStep>,
}

/// Collaborators backing the standard pipeline
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn ThreadCapture>,
    pub transformer: Arc<dyn DocumentTransformer>,
    pub publisher: Arc<dyn DocumentPublisher>,
    pub notifier: Arc<dyn Notifier>,
}

/// Per-step retry policies of the standard pipeline
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StepPolicies {
    #[serde(default)]
    pub capture: RetryPolicy,
    #[serde(default)]
    pub transform: RetryPolicy,
    #[serde(default)]
    pub publish: RetryPolicy,
    #[serde(default)]
    pub notify: RetryPolicy,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<PipelineStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// The fixed capture -> transform -> publish -> notify pipeline
    pub fn standard(
        name: impl Into<String>,
        collaborators: Collaborators,
        templates: Arc<TemplateRegistry>,
        policies: &StepPolicies,
    ) -> Self {
        Self::new(
            name,
            vec![
                PipelineStep::new(
                    STEP_CAPTURE,
                    policies.capture.clone(),
                    Arc::new(CaptureStep {
                        capture: collaborators.capture,
                    }),
                ),
                PipelineStep::new(
                    STEP_TRANSFORM,
                    policies.transform.clone(),
                    Arc::new(TransformStep {
                        transformer: collaborators.transformer,
                        templates: templates.clone(),
                    }),
                ),
                PipelineStep::new(
                    STEP_PUBLISH,
                    policies.publish.clone(),
                    Arc::new(PublishStep {
                        publisher: collaborators.publisher,
                        templates,
                    }),
                ),
                PipelineStep::new(
                    STEP_NOTIFY,
                    policies.notify.clone(),
                    Arc::new(NotifyStep {
                        notifier: collaborators.notifier,
                    }),
                ),
            ],
        )
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }
            if self.steps[..i].iter().any(|s| s.name == step.name) {
                anyhow::bail!("Duplicate step name '{}'", step.name);
            }
            step.retry_policy.validate()?;
        }

        Ok(())
    }

    /// Names of the steps, in order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Templates by id, with a fallback
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, DocumentTemplate>,
    default_id: Option<String>,
}

impl TemplateRegistry {
    pub fn new(templates: impl IntoIterator<Item = DocumentTemplate>, default_id: Option<String>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.id.clone(), t)).collect(),
            default_id,
        }
    }

    /// Resolve the run's template, or the default when the run names none
    pub fn resolve(&self, template_id: Option<&str>) -> Result<&DocumentTemplate, WorkflowError> {
        let id = template_id.or(self.default_id.as_deref()).ok_or_else(|| {
            WorkflowError::configuration("No template given and no default template configured")
                .with_code(codes::UNKNOWN_TEMPLATE)
        })?;

        self.templates.get(id).ok_or_else(|| {
            WorkflowError::configuration(format!("Unknown template '{}'", id))
                .with_code(codes::UNKNOWN_TEMPLATE)
                .with_context("template_id", id)
        })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn decode_input<T: DeserializeOwned>(ctx: &StepContext, input: &Value) -> Result<T, WorkflowError> {
    serde_json::from_value(input.clone()).map_err(|e| {
        WorkflowError::configuration(format!(
            "Step '{}' received malformed input: {}",
            ctx.step_name, e
        ))
        .with_code(codes::INVALID_STEP_INPUT)
        .with_context("step_name", &ctx.step_name)
    })
}

fn encode_output<T: Serialize>(output: &T) -> Result<Value> {
    Ok(serde_json::to_value(output)?)
}

struct CaptureStep {
    capture: Arc<dyn ThreadCapture>,
}

#[async_trait]
impl StepAction for CaptureStep {
    async fn execute(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let thread: ThreadRef = decode_input(ctx, input)?;
        let content = self.capture.capture(&thread).await?;
        encode_output(&content)
    }
}

struct TransformStep {
    transformer: Arc<dyn DocumentTransformer>,
    templates: Arc<TemplateRegistry>,
}

#[async_trait]
impl StepAction for TransformStep {
    async fn execute(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let content: ThreadContent = decode_input(ctx, input)?;
        let template = self.templates.resolve(ctx.template_id.as_deref())?;
        let document = self.transformer.transform(&content, template).await?;
        encode_output(&document)
    }
}

struct PublishStep {
    publisher: Arc<dyn DocumentPublisher>,
    templates: Arc<TemplateRegistry>,
}

#[async_trait]
impl StepAction for PublishStep {
    async fn execute(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let document: Document = decode_input(ctx, input)?;
        let template = self.templates.resolve(ctx.template_id.as_deref())?;
        let receipt = self.publisher.publish(&document, &template.destination).await?;
        encode_output(&receipt)
    }
}

struct NotifyStep {
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl StepAction for NotifyStep {
    async fn execute(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let receipt: Receipt = decode_input(ctx, input)?;
        let ack = self.notifier.notify(&receipt).await?;
        encode_output(&ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl StepAction for Echo {
        async fn execute(&self, _ctx: &StepContext, input: &Value) -> Result<Value> {
            Ok(input.clone())
        }
    }

    fn step(name: &str) -> PipelineStep {
        PipelineStep::new(name, RetryPolicy::default(), Arc::new(Echo))
    }

    fn template(id: &str) -> DocumentTemplate {
        DocumentTemplate {
            id: id.to_string(),
            prompt: "Summarize".to_string(),
            destination: format!("db-{}", id),
        }
    }

    #[test]
    fn test_pipeline_validation() {
        let pipeline = Pipeline::new("thread_to_notion", vec![step("a"), step("b")]);
        assert!(pipeline.validate().is_ok());
        assert_eq!(pipeline.step_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_invalid_pipelines() {
        assert!(Pipeline::new("empty", vec![]).validate().is_err());
        assert!(Pipeline::new("", vec![step("a")]).validate().is_err());
        assert!(Pipeline::new("dup", vec![step("a"), step("a")]).validate().is_err());

        let mut bad = step("a");
        bad.retry_policy.base_interval = f64::NAN;
        assert!(Pipeline::new("nan", vec![bad]).validate().is_err());
    }

    #[test]
    fn test_template_resolution() {
        let registry = TemplateRegistry::new(
            vec![template("meeting"), template("incident")],
            Some("meeting".to_string()),
        );

        assert_eq!(registry.resolve(Some("incident")).unwrap().destination, "db-incident");
        assert_eq!(registry.resolve(None).unwrap().id, "meeting");

        let err = registry.resolve(Some("missing")).unwrap_err();
        assert!(err.has_code(codes::UNKNOWN_TEMPLATE));
        assert_eq!(err.kind(), crate::domain::ErrorKind::Configuration);
    }

    #[test]
    fn test_no_default_template() {
        let registry = TemplateRegistry::new(vec![template("meeting")], None);
        assert!(registry.resolve(None).is_err());
    }

    #[tokio::test]
    async fn test_malformed_input_is_a_configuration_error() {
        struct NeverCalled;

        #[async_trait]
        impl ThreadCapture for NeverCalled {
            async fn capture(&self, _thread: &ThreadRef) -> Result<ThreadContent> {
                panic!("capture should not be reached");
            }
        }

        let step = CaptureStep {
            capture: Arc::new(NeverCalled),
        };
        let ctx = StepContext {
            run_id: Uuid::new_v4(),
            workflow_name: "w".to_string(),
            step_name: STEP_CAPTURE.to_string(),
            template_id: None,
        };

        let err = step
            .execute(&ctx, &serde_json::json!({"nope": 1}))
            .await
            .unwrap_err();
        let domain = err.downcast_ref::<WorkflowError>().unwrap();
        assert!(domain.has_code(codes::INVALID_STEP_INPUT));
    }
}
