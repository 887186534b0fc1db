use failure::Fail;

#[derive(Debug, Fail)]
pub enum NluEngineError {
    #[fail(
        display = "{} could not load model. Inner error is: {}",
        component, inner
    )]
    ModelLoading { component: String, inner: String },
    #[fail(display = "Training \"{}\" was canceled", _0)]
    TrainingCanceled(String),
    #[fail(display = "Training \"{}\" already started", _0)]
    TrainingAlreadyStarted(String),
    #[fail(
        display = "Can't load model {} as it is bigger than the maximum allowed size (model size: {} bytes, max allowed: {} bytes). You can increase the cache size in the engine config.",
        model_id, size, max
    )]
    ModelTooLarge {
        model_id: String,
        size: usize,
        max: usize,
    },
    #[fail(display = "Language service error: {}", _0)]
    LanguageService(String),
    #[fail(display = "System entity service error: {}", _0)]
    SystemEntityService(String),
    #[fail(display = "Invalid model id: '{}'", _0)]
    InvalidModelId(String),
    #[fail(
        display = "No models loaded for the following languages: [{}]",
        _0
    )]
    MissingLanguageModels(String),
    #[fail(display = "Internal error: {}", _0)]
    InternalError(String),
}

pub type Result<T> = ::std::result::Result<T, ::failure::Error>;

pub fn is_training_canceled(error: &::failure::Error) -> bool {
    match error.downcast_ref::<NluEngineError>() {
        Some(NluEngineError::TrainingCanceled(_)) => true,
        _ => false,
    }
}

pub fn model_loading_error(component: &str, cause: ::failure::Error) -> ::failure::Error {
    NluEngineError::ModelLoading {
        component: component.to_string(),
        inner: cause.to_string(),
    }
    .into()
}
