//! Declarative macros for constructing effects.

/// Create an `Effect::Future` from an async block body
///
/// The body is wrapped in `async move`, so collaborators must be cloned into
/// locals before the macro is invoked.
///
/// # Example
///
/// ```rust,ignore
/// use venue_core::async_effect;
///
/// let storage = Arc::clone(&env.storage);
/// async_effect! {
///     match storage.load_event(event_id).await {
///         Ok(event) => Some(CheckoutAction::EventLoaded { event }),
///         Err(error) => Some(CheckoutAction::LoadFailed { error: error.to_string() }),
///     }
/// }
/// ```
#[macro_export]
macro_rules! async_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::Future(
            ::std::boxed::Box::pin(async move { $($body)* })
        )
    };
}

/// Create an `Effect::Delay`
///
/// # Example
///
/// ```rust,ignore
/// use venue_core::delay;
/// use std::time::Duration;
///
/// delay! {
///     duration: Duration::from_secs(120),
///     action: CheckoutAction::AuthorizationTimedOut { attempt_id }
/// }
/// ```
#[macro_export]
macro_rules! delay {
    (
        duration: $duration:expr,
        action: $action:expr
    ) => {
        $crate::effect::Effect::Delay {
            duration: $duration,
            action: ::std::boxed::Box::new($action),
        }
    };
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use crate::effect::Effect;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    enum ScanAction {
        Decoded { code: String },
        FrameDue,
    }

    #[tokio::test]
    async fn test_async_effect_macro_produces_action() {
        let code = "booking-42".to_string();
        let effect = async_effect! {
            Some(ScanAction::Decoded { code })
        };

        let Effect::Future(fut) = effect else {
            panic!("expected Effect::Future");
        };
        assert_eq!(
            fut.await,
            Some(ScanAction::Decoded {
                code: "booking-42".to_string()
            })
        );
    }

    #[test]
    fn test_delay_macro() {
        let effect = delay! {
            duration: Duration::from_millis(33),
            action: ScanAction::FrameDue
        };

        assert!(matches!(effect, Effect::Delay { .. }));
    }
}
