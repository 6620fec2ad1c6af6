//! FMI 2.0 wire boundary.
//!
//! The binary interface loader lives outside this crate: it resolves the
//! compiled unit's entry points and hands them over as a vector of
//! [`ApiSymbol`]s. Everything here turns that vector into typed entry points
//! and hides the raw calls behind the [`FmuBinary`] and [`FmuInstance`]
//! seams, so the rest of the crate (and the test mocks) never touch FFI.

use crate::error::FmuError;
use std::ffi::{c_char, c_int, c_uint, c_void, CString};
use std::mem;

/// Status code returned by every wire call. Consumed strictly as
/// success/failure by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmiStatus {
    Ok,
    Warning,
    Discard,
    Error,
    Fatal,
    Pending,
}

impl FmiStatus {
    pub fn from_code(code: c_int) -> Self {
        match code {
            0 => FmiStatus::Ok,
            1 => FmiStatus::Warning,
            2 => FmiStatus::Discard,
            4 => FmiStatus::Fatal,
            5 => FmiStatus::Pending,
            _ => FmiStatus::Error,
        }
    }

    pub fn is_ok(self) -> bool {
        self == FmiStatus::Ok
    }
}

pub type Component = *mut c_void;
pub type ValueReference = c_uint;

// Entry point signatures, as declared by the FMI 2.0 standard headers.
pub type InstantiateFn = unsafe extern "C" fn(
    *const c_char,
    c_int,
    *const c_char,
    *const c_char,
    *const CallbackFunctions,
    c_int,
    c_int,
) -> Component;
pub type FreeInstanceFn = unsafe extern "C" fn(Component);
pub type ResetFn = unsafe extern "C" fn(Component) -> c_int;
pub type SetupExperimentFn =
    unsafe extern "C" fn(Component, c_int, f64, f64, c_int, f64) -> c_int;
pub type EnterInitializationModeFn = unsafe extern "C" fn(Component) -> c_int;
pub type ExitInitializationModeFn = unsafe extern "C" fn(Component) -> c_int;
pub type SetRealFn =
    unsafe extern "C" fn(Component, *const ValueReference, usize, *const f64) -> c_int;
pub type GetRealFn =
    unsafe extern "C" fn(Component, *const ValueReference, usize, *mut f64) -> c_int;
pub type GetDirectionalDerivativeFn = unsafe extern "C" fn(
    Component,
    *const ValueReference,
    usize,
    *const ValueReference,
    usize,
    *const f64,
    *mut f64,
) -> c_int;

pub type LoggerFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, c_int, *const c_char, *const c_char, ...);
pub type AllocateMemoryFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type FreeMemoryFn = unsafe extern "C" fn(*mut c_void);
pub type StepFinishedFn = unsafe extern "C" fn(*mut c_void, c_int);

/// fmi2CallbackFunctions. Must stay alive for as long as any instance
/// created with it.
#[repr(C)]
pub struct CallbackFunctions {
    pub logger: Option<LoggerFn>,
    pub allocate_memory: Option<AllocateMemoryFn>,
    pub free_memory: Option<FreeMemoryFn>,
    pub step_finished: Option<StepFinishedFn>,
    pub component_environment: *mut c_void,
}

impl Default for CallbackFunctions {
    fn default() -> Self {
        Self {
            logger: None,
            allocate_memory: Some(libc::calloc as AllocateMemoryFn),
            free_memory: Some(libc::free as FreeMemoryFn),
            step_finished: None,
            component_environment: std::ptr::null_mut(),
        }
    }
}

/// One resolved entry point, as supplied by the loader.
#[derive(Debug, Clone)]
pub struct ApiSymbol {
    pub name: String,
    pub ptr: *mut c_void,
}

impl ApiSymbol {
    pub fn new(name: impl Into<String>, ptr: *mut c_void) -> Self {
        Self {
            name: name.into(),
            ptr,
        }
    }
}

/// Typed entry points of one loaded unit.
#[derive(Clone, Copy, Debug)]
pub struct SymbolTable {
    pub instantiate: InstantiateFn,
    pub free_instance: FreeInstanceFn,
    pub reset: ResetFn,
    pub setup_experiment: SetupExperimentFn,
    pub enter_initialization_mode: EnterInitializationModeFn,
    pub exit_initialization_mode: ExitInitializationModeFn,
    pub set_real: SetRealFn,
    pub get_real: GetRealFn,
    /// Resolved only when the unit declares directional derivative support.
    pub get_directional_derivative: Option<GetDirectionalDerivativeFn>,
}

impl SymbolTable {
    /// Types the loader-supplied symbol vector. The directional derivative
    /// entry point is looked up only when `with_directional` is set.
    pub fn resolve(symbols: &[ApiSymbol], with_directional: bool) -> Result<Self, FmuError> {
        let find = |name: &str| -> Result<*mut c_void, FmuError> {
            symbols
                .iter()
                .find(|s| s.name == name && !s.ptr.is_null())
                .map(|s| s.ptr)
                .ok_or_else(|| FmuError::MissingSymbol(name.to_string()))
        };
        unsafe {
            Ok(Self {
                instantiate: mem::transmute::<*mut c_void, InstantiateFn>(find(
                    "fmi2Instantiate",
                )?),
                free_instance: mem::transmute::<*mut c_void, FreeInstanceFn>(find(
                    "fmi2FreeInstance",
                )?),
                reset: mem::transmute::<*mut c_void, ResetFn>(find("fmi2Reset")?),
                setup_experiment: mem::transmute::<*mut c_void, SetupExperimentFn>(find(
                    "fmi2SetupExperiment",
                )?),
                enter_initialization_mode: mem::transmute::<*mut c_void, EnterInitializationModeFn>(
                    find("fmi2EnterInitializationMode")?,
                ),
                exit_initialization_mode: mem::transmute::<*mut c_void, ExitInitializationModeFn>(
                    find("fmi2ExitInitializationMode")?,
                ),
                set_real: mem::transmute::<*mut c_void, SetRealFn>(find("fmi2SetReal")?),
                get_real: mem::transmute::<*mut c_void, GetRealFn>(find("fmi2GetReal")?),
                get_directional_derivative: if with_directional {
                    Some(mem::transmute::<*mut c_void, GetDirectionalDerivativeFn>(
                        find("fmi2GetDirectionalDerivative")?,
                    ))
                } else {
                    None
                },
            })
        }
    }
}

/// A loaded unit, able to create live instances.
pub trait FmuBinary: Send + Sync {
    fn instantiate(&self) -> Result<Box<dyn FmuInstance>, FmuError>;
}

/// One live, non-reentrant simulation instance. All calls against one
/// instance are strictly sequential.
pub trait FmuInstance: Send {
    fn setup_experiment(
        &mut self,
        tolerance: Option<f64>,
        start_time: f64,
        stop_time: Option<f64>,
    ) -> FmiStatus;
    fn reset(&mut self) -> FmiStatus;
    fn enter_initialization_mode(&mut self) -> FmiStatus;
    fn exit_initialization_mode(&mut self) -> FmiStatus;
    fn set_real(&mut self, refs: &[u32], values: &[f64]) -> FmiStatus;
    fn get_real(&mut self, refs: &[u32], values: &mut [f64]) -> FmiStatus;
    fn get_directional_derivative(
        &mut self,
        unknown_refs: &[u32],
        known_refs: &[u32],
        seed: &[f64],
        out: &mut [f64],
    ) -> FmiStatus;
}

const MODEL_EXCHANGE: c_int = 0;

/// [`FmuBinary`] backed by a resolved symbol table.
pub struct SymbolBinary {
    table: SymbolTable,
    instance_name: CString,
    guid: CString,
    resource_location: CString,
    logging_on: bool,
    callbacks: Box<CallbackFunctions>,
}

// The table is immutable after construction and the callback block is only
// read by the unit.
unsafe impl Send for SymbolBinary {}
unsafe impl Sync for SymbolBinary {}

impl SymbolBinary {
    pub fn new(
        symbols: &[ApiSymbol],
        model_identifier: &str,
        guid: &str,
        resource_location: &str,
        logging_on: bool,
        with_directional: bool,
    ) -> Result<Self, FmuError> {
        let table = SymbolTable::resolve(symbols, with_directional)?;
        let to_cstring = |s: &str| {
            CString::new(s).map_err(|_| FmuError::Instantiate(format!("embedded NUL in '{s}'")))
        };
        Ok(Self {
            table,
            instance_name: to_cstring(model_identifier)?,
            guid: to_cstring(guid)?,
            resource_location: to_cstring(resource_location)?,
            logging_on,
            callbacks: Box::new(CallbackFunctions::default()),
        })
    }
}

impl FmuBinary for SymbolBinary {
    fn instantiate(&self) -> Result<Box<dyn FmuInstance>, FmuError> {
        let component = unsafe {
            (self.table.instantiate)(
                self.instance_name.as_ptr(),
                MODEL_EXCHANGE,
                self.guid.as_ptr(),
                self.resource_location.as_ptr(),
                &*self.callbacks,
                0,
                self.logging_on as c_int,
            )
        };
        if component.is_null() {
            return Err(FmuError::Instantiate(
                self.instance_name.to_string_lossy().into_owned(),
            ));
        }
        Ok(Box::new(SymbolInstance {
            component,
            table: self.table,
        }))
    }
}

/// [`FmuInstance`] backed by a live component handle. Freed on drop.
pub struct SymbolInstance {
    component: Component,
    table: SymbolTable,
}

// An instance is leased to exactly one worker at a time.
unsafe impl Send for SymbolInstance {}

impl Drop for SymbolInstance {
    fn drop(&mut self) {
        unsafe { (self.table.free_instance)(self.component) };
    }
}

impl FmuInstance for SymbolInstance {
    fn setup_experiment(
        &mut self,
        tolerance: Option<f64>,
        start_time: f64,
        stop_time: Option<f64>,
    ) -> FmiStatus {
        let code = unsafe {
            (self.table.setup_experiment)(
                self.component,
                tolerance.is_some() as c_int,
                tolerance.unwrap_or(0.0),
                start_time,
                stop_time.is_some() as c_int,
                stop_time.unwrap_or(0.0),
            )
        };
        FmiStatus::from_code(code)
    }

    fn reset(&mut self) -> FmiStatus {
        FmiStatus::from_code(unsafe { (self.table.reset)(self.component) })
    }

    fn enter_initialization_mode(&mut self) -> FmiStatus {
        FmiStatus::from_code(unsafe { (self.table.enter_initialization_mode)(self.component) })
    }

    fn exit_initialization_mode(&mut self) -> FmiStatus {
        FmiStatus::from_code(unsafe { (self.table.exit_initialization_mode)(self.component) })
    }

    fn set_real(&mut self, refs: &[u32], values: &[f64]) -> FmiStatus {
        debug_assert_eq!(refs.len(), values.len());
        let code = unsafe {
            (self.table.set_real)(self.component, refs.as_ptr(), refs.len(), values.as_ptr())
        };
        FmiStatus::from_code(code)
    }

    fn get_real(&mut self, refs: &[u32], values: &mut [f64]) -> FmiStatus {
        debug_assert_eq!(refs.len(), values.len());
        let code = unsafe {
            (self.table.get_real)(
                self.component,
                refs.as_ptr(),
                refs.len(),
                values.as_mut_ptr(),
            )
        };
        FmiStatus::from_code(code)
    }

    fn get_directional_derivative(
        &mut self,
        unknown_refs: &[u32],
        known_refs: &[u32],
        seed: &[f64],
        out: &mut [f64],
    ) -> FmiStatus {
        let Some(call) = self.table.get_directional_derivative else {
            return FmiStatus::Error;
        };
        let code = unsafe {
            call(
                self.component,
                unknown_refs.as_ptr(),
                unknown_refs.len(),
                known_refs.as_ptr(),
                known_refs.len(),
                seed.as_ptr(),
                out.as_mut_ptr(),
            )
        };
        FmiStatus::from_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiSymbol, FmiStatus, SymbolTable};
    use crate::error::FmuError;
    use std::ffi::c_void;

    fn dummy_symbols(names: &[&str]) -> Vec<ApiSymbol> {
        // The pointers are typed but never called in these tests.
        names
            .iter()
            .map(|n| ApiSymbol::new(*n, 8usize as *mut c_void))
            .collect()
    }

    const REQUIRED: [&str; 8] = [
        "fmi2Instantiate",
        "fmi2FreeInstance",
        "fmi2Reset",
        "fmi2SetupExperiment",
        "fmi2EnterInitializationMode",
        "fmi2ExitInitializationMode",
        "fmi2SetReal",
        "fmi2GetReal",
    ];

    #[test]
    fn status_codes_map_to_success_or_failure() {
        assert!(FmiStatus::from_code(0).is_ok());
        assert!(!FmiStatus::from_code(1).is_ok());
        assert!(!FmiStatus::from_code(3).is_ok());
        assert_eq!(FmiStatus::from_code(4), FmiStatus::Fatal);
        assert_eq!(FmiStatus::from_code(42), FmiStatus::Error);
    }

    #[test]
    fn resolve_requires_every_entry_point() {
        let mut names = REQUIRED.to_vec();
        names.retain(|n| *n != "fmi2Reset");
        let err = SymbolTable::resolve(&dummy_symbols(&names), false).unwrap_err();
        match err {
            FmuError::MissingSymbol(name) => assert_eq!(name, "fmi2Reset"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn directional_derivative_is_optional() {
        let table = SymbolTable::resolve(&dummy_symbols(&REQUIRED), false).unwrap();
        assert!(table.get_directional_derivative.is_none());

        let err = SymbolTable::resolve(&dummy_symbols(&REQUIRED), true).unwrap_err();
        assert!(matches!(err, FmuError::MissingSymbol(_)));

        let mut names = REQUIRED.to_vec();
        names.push("fmi2GetDirectionalDerivative");
        let table = SymbolTable::resolve(&dummy_symbols(&names), true).unwrap();
        assert!(table.get_directional_derivative.is_some());
    }
}
