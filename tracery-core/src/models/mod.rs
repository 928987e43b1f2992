pub mod event;
pub mod screen;
pub mod workflow;

pub use event::{CapturedEvent, EventTarget, EventType, InputMeta};
pub use screen::{screen_label, CanonicalScreen};
pub use workflow::{
    DetectedInstance, ParameterDef, ParameterType, StepSnapshot, TemplateStep, WorkflowInstance,
    WorkflowTemplate,
};
