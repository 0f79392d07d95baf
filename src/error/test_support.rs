use super::{
    AddressError, AppError, ConfigError, ConnectionError, PhaseError, ProcessError, ProtocolError,
    RegistryError, RoutingError,
};

macro_rules! test_expectation_from {
    ($($error:ident),+ $(,)?) => {
        $(
            impl From<&'static str> for $error {
                fn from(message: &'static str) -> Self {
                    $error::TestExpectation { message }
                }
            }

            impl From<String> for $error {
                fn from(value: String) -> Self {
                    $error::TestExpectationValue {
                        message: "Test expectation failed",
                        value,
                    }
                }
            }
        )+
    };
}

test_expectation_from!(
    AddressError,
    AppError,
    ConfigError,
    ConnectionError,
    PhaseError,
    ProcessError,
    ProtocolError,
    RegistryError,
    RoutingError,
);
