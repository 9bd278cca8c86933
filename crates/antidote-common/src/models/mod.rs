//! Lesson, lab and session model

mod lesson;
mod live;
mod request;

pub use lesson::{
    Connection, GuideType, Image, Lesson, LessonEndpoint, LessonStage, Presentation,
    PresentationType, JUPYTER_ENDPOINT_NAME, JUPYTER_PORT,
};
pub use live::{LiveEndpoint, LiveLesson, LiveLessonStatus, LiveSession};
pub use request::{LessonScheduleRequest, OperationType};
