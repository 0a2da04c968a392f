// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Keyshield

//! Keyshield Environment Guard - Rust Implementation
//!
//! Integrity gate for AES key material embedded in a host Android app.
//! At initialization the guard validates installer provenance and probes for
//! debuggable builds, emulators, ADB instrumentation and insecure devices.
//! An unsafe environment destroys the embedded key material (zero-filled,
//! same lengths) instead of releasing it; downstream crypto then fails with
//! useless keys, which is the intended behavior.

use std::fs;
use std::io::Read;
use std::path::Path;

use jni::objects::{JClass, JObject, JString, JValue};
use jni::sys::{jboolean, jbyteArray, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

#[cfg(target_os = "android")]
use android_logger::Config;
#[cfg(target_os = "android")]
use log::LevelFilter;

/// AES key length in bytes.
pub const AES_KEY_SIZE: usize = 32;

/// AES initialization vector length in bytes.
pub const AES_IV_SIZE: usize = 16;

/// Maximum length of a system property value, including the terminator.
pub const PROP_VALUE_MAX: usize = 92;

/// How many bytes of `/proc/<pid>/cmdline` are inspected.
pub const CMDLINE_READ_LIMIT: usize = 64;

// ============================================================================
// Build-Time Policy
// ============================================================================

// Policy knobs compiled into this build. The packaging step rewrites these
// constants when the library is embedded into a host app; the defaults keep
// every check off and the key material zero.
const HALT_IF_DEBUGGABLE: bool = false;
const HALT_IF_ADB: bool = false;
const HALT_IF_EMULATOR: bool = false;
const HALT_IF_INSECURE: bool = false;
const TRUSTED_INSTALLERS: &[&str] = &[];
const SIGNING_CERTIFICATE: &str = "";
const EMBEDDED_AES_KEY: [u8; AES_KEY_SIZE] = [0; AES_KEY_SIZE];
const EMBEDDED_AES_IV: [u8; AES_IV_SIZE] = [0; AES_IV_SIZE];

/// Build-time policy for the environment gate.
///
/// Each `halt_if_*` flag gates one integrity check. A flag left off makes
/// that check intentionally inert - it contributes nothing to the verdict.
/// That is a policy decision, not a detection gap.
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub halt_if_debuggable: bool,
    pub halt_if_adb: bool,
    pub halt_if_emulator: bool,
    pub halt_if_insecure: bool,
    /// Trusted installer package prefixes. Empty list disables installer
    /// validation entirely (vacuous pass), it is not an automatic failure.
    pub trusted_installers: &'static [&'static str],
    /// Reserved for a signing-certificate check. Declared but not consulted
    /// by any current check.
    pub signing_certificate: &'static str,
    pub aes_key: [u8; AES_KEY_SIZE],
    pub aes_iv: [u8; AES_IV_SIZE],
}

impl GuardPolicy {
    /// The policy compiled into this build.
    pub const fn builtin() -> Self {
        GuardPolicy {
            halt_if_debuggable: HALT_IF_DEBUGGABLE,
            halt_if_adb: HALT_IF_ADB,
            halt_if_emulator: HALT_IF_EMULATOR,
            halt_if_insecure: HALT_IF_INSECURE,
            trusted_installers: TRUSTED_INSTALLERS,
            signing_certificate: SIGNING_CERTIFICATE,
            aes_key: EMBEDDED_AES_KEY,
            aes_iv: EMBEDDED_AES_IV,
        }
    }
}

// ============================================================================
// Collaborator Contracts
// ============================================================================

/// Read access to the platform property store.
///
/// Absent keys yield `None`; implementations never fail the caller.
pub trait PropertyStore {
    fn get(&self, name: &str) -> Option<String>;
}

/// Evidence from the current process's own metadata record.
pub trait ProcessMetadata {
    /// True iff the debug marker appears in the inspected prefix of the
    /// process identity record. Unreadable record means no evidence.
    fn has_debug_marker(&self) -> bool;
}

/// Narrow view of the host application: who we are and who installed us.
pub trait HostContext {
    fn own_package(&mut self) -> Option<String>;
    fn installer_of(&mut self, package: &str) -> Option<String>;
}

/// System property store backed by the platform property service.
pub struct SystemPropertyStore;

#[cfg(target_os = "android")]
impl PropertyStore for SystemPropertyStore {
    fn get(&self, name: &str) -> Option<String> {
        use std::ffi::CString;

        let name = CString::new(name).ok()?;
        let mut value = [0u8; PROP_VALUE_MAX];
        let length =
            unsafe { libc::__system_property_get(name.as_ptr(), value.as_mut_ptr().cast()) };
        if length <= 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&value[..length as usize]).into_owned())
    }
}

#[cfg(not(target_os = "android"))]
impl PropertyStore for SystemPropertyStore {
    fn get(&self, _name: &str) -> Option<String> {
        // No property service off Android
        None
    }
}

const DEBUG_CMDLINE_MARKER: &[u8] = b"debug";

/// Process metadata read from `/proc/<pid>/cmdline` of the current process.
///
/// On a debuggable install the application id carries a "debug" suffix,
/// e.g. `com.example.app.debug`.
pub struct ProcCmdline;

impl ProcessMetadata for ProcCmdline {
    fn has_debug_marker(&self) -> bool {
        let path = format!("/proc/{}/cmdline", std::process::id());
        cmdline_contains_marker(Path::new(&path), DEBUG_CMDLINE_MARKER)
    }
}

/// Scan a bounded prefix of `path` for `marker`. Anything unreadable counts
/// as no evidence.
fn cmdline_contains_marker(path: &Path, marker: &[u8]) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };

    let mut prefix = [0u8; CMDLINE_READ_LIMIT];
    let read = match file.read(&mut prefix) {
        Ok(read) => read,
        Err(_) => return false,
    };

    prefix[..read].windows(marker.len()).any(|window| window == marker)
}

// ============================================================================
// Signature Tables
// ============================================================================

// Each entry is (property name, marker substring). A property whose value
// contains the marker counts as one sign of an unsafe environment for the
// owning check. Relevant notes:
// - getprop in adb shell
// - https://android.googlesource.com/platform/system/core/+/android-4.1.2_r1/init/readme.txt

/// Properties of debuggable builds and generic/sdk images.
const DEBUG_SIGNATURES: &[(&str, &str)] = &[
    ("ro.debuggable", "1"),
    ("ro.kernel.android.checkjni", "1"),
    ("ro.build.fingerprint", "debug"),
    ("ro.build.product", "generic"),
    ("ro.product.device", "generic"),
];

/// Properties present while ADB is active or persisted on.
const ADB_SIGNATURES: &[(&str, &str)] = &[
    ("sys.usb.state", "adb"),
    ("sys.usb.config", "adb"),
    ("ro.adb.secure", "1"),
    ("qemu.adb.secure", "0"),
    ("persist.adb.notify", "1"),
    ("persist.sys.usb.config", "adb"),
];

/// QEMU / goldfish / ranchu emulator fingerprints.
const EMULATOR_SIGNATURES: &[(&str, &str)] = &[
    ("ro.kernel.qemu", "1"),
    ("ro.hardware", "goldfish"),
    ("ro.hardware", "ranchu"),
    ("ro.setupwizard.mode", "EMULATOR"),
    ("ro.build.characteristics", "emulator"),
    ("qemu.sf.fake_camera", "both"),
    ("qemu.sf.fake_camera", "back"),
    ("ro.hardware.audio.primary", "goldfish"),
];

/// Device not in a secure state.
const INSECURE_SIGNATURES: &[(&str, &str)] = &[
    ("ro.secure", "0"),
    ("persist.service.adb.enable", "1"),
];

// ============================================================================
// Probes
// ============================================================================

/// True iff the property exists, is non-empty and contains `marker` as a
/// contiguous substring. Absence is evidence of nothing.
fn property_contains(store: &dyn PropertyStore, name: &str, marker: &str) -> bool {
    match store.get(name) {
        Some(value) if !value.is_empty() => value.contains(marker),
        _ => false,
    }
}

/// Evaluate a signature table, returning one flag string per match.
fn scan_signatures(
    store: &dyn PropertyStore,
    signatures: &[(&str, &str)],
    label: &str,
) -> Vec<String> {
    signatures
        .iter()
        .filter(|(name, marker)| property_contains(store, name, marker))
        .map(|(name, marker)| format!("{} property: {}={}", label, name, marker))
        .collect()
}

// ============================================================================
// Integrity Checks
// ============================================================================

/// Debuggable build: property signatures plus the process cmdline marker.
fn check_debug(
    policy: &GuardPolicy,
    store: &dyn PropertyStore,
    meta: &dyn ProcessMetadata,
) -> Vec<String> {
    if !policy.halt_if_debuggable {
        return Vec::new();
    }

    let mut flagged = scan_signatures(store, DEBUG_SIGNATURES, "Debug");
    if meta.has_debug_marker() {
        flagged.push("Debug marker in process cmdline".to_string());
    }
    flagged
}

fn check_adb(policy: &GuardPolicy, store: &dyn PropertyStore) -> Vec<String> {
    if !policy.halt_if_adb {
        return Vec::new();
    }
    scan_signatures(store, ADB_SIGNATURES, "ADB")
}

fn check_emulator(policy: &GuardPolicy, store: &dyn PropertyStore) -> Vec<String> {
    if !policy.halt_if_emulator {
        return Vec::new();
    }
    scan_signatures(store, EMULATOR_SIGNATURES, "Emulator")
}

fn check_secure_environment(policy: &GuardPolicy, store: &dyn PropertyStore) -> Vec<String> {
    if !policy.halt_if_insecure {
        return Vec::new();
    }
    scan_signatures(store, INSECURE_SIGNATURES, "Insecure device")
}

// ============================================================================
// Installer Validation
// ============================================================================

/// Validate installer provenance against the trusted prefixes.
///
/// Returns `None` on pass, or the flag string on failure. An empty trusted
/// list passes without querying the host. An installer that cannot be
/// resolved is untrusted - an unknown provenance must not be assumed safe.
fn validate_installer(trusted: &[&str], host: &mut dyn HostContext) -> Option<String> {
    if trusted.is_empty() {
        return None;
    }

    let package = match host.own_package() {
        Some(package) => package,
        None => return Some("Installer unresolved: own package unavailable".to_string()),
    };
    let installer = match host.installer_of(&package) {
        Some(installer) => installer,
        None => return Some("Installer unresolved: no installer package".to_string()),
    };

    if trusted.iter().any(|prefix| installer.starts_with(prefix)) {
        None
    } else {
        Some(format!("Untrusted installer: {}", installer))
    }
}

// ============================================================================
// Guarded Key Store
// ============================================================================

/// Outcome of one environment evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentReport {
    pub is_safe: bool,
    pub flagged_signals: Vec<String>,
}

struct KeyMaterial {
    iv: [u8; AES_IV_SIZE],
    key: [u8; AES_KEY_SIZE],
}

impl KeyMaterial {
    fn destroy(&mut self) {
        self.iv.zeroize();
        self.key.zeroize();
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Owner of the embedded key material.
///
/// The environment is evaluated exactly once, at [`GuardedKeys::initialize`],
/// reflecting the state at process start. If the verdict is unsafe both
/// buffers are zero-filled before the value is returned; the accessors only
/// ever report stored state and never re-evaluate.
pub struct GuardedKeys {
    report: EnvironmentReport,
    material: KeyMaterial,
}

impl GuardedKeys {
    /// Run the gate and take ownership of the key material.
    ///
    /// The installer validation and the four integrity checks all run to
    /// completion so the report lists every flagged signal, but a single
    /// flag is enough to make the verdict unsafe.
    pub fn initialize(
        policy: &GuardPolicy,
        store: &dyn PropertyStore,
        meta: &dyn ProcessMetadata,
        host: &mut dyn HostContext,
    ) -> GuardedKeys {
        let mut flagged = Vec::new();

        if let Some(reason) = validate_installer(policy.trusted_installers, host) {
            flagged.push(reason);
        }
        flagged.extend(check_debug(policy, store, meta));
        flagged.extend(check_adb(policy, store));
        flagged.extend(check_emulator(policy, store));
        flagged.extend(check_secure_environment(policy, store));

        let is_safe = flagged.is_empty();
        let mut material = KeyMaterial {
            iv: policy.aes_iv,
            key: policy.aes_key,
        };

        if !is_safe {
            for signal in &flagged {
                log::debug!("Flagged: {}", signal);
            }
            log::warn!(
                "Environment unsafe ({} signals), destroying key material",
                flagged.len()
            );
            material.destroy();
        }

        GuardedKeys {
            report: EnvironmentReport {
                is_safe,
                flagged_signals: flagged,
            },
            material,
        }
    }

    pub fn is_safe_to_use(&self) -> bool {
        self.report.is_safe
    }

    pub fn report(&self) -> &EnvironmentReport {
        &self.report
    }

    /// The stored IV: the provisioned bytes, or all zeros after destruction.
    pub fn initial_vector(&self) -> &[u8; AES_IV_SIZE] {
        &self.material.iv
    }

    /// The stored key: the provisioned bytes, or all zeros after destruction.
    pub fn key(&self) -> &[u8; AES_KEY_SIZE] {
        &self.material.key
    }
}

// ============================================================================
// Android Host Context
// ============================================================================

/// [`HostContext`] backed by an `android.content.Context` over JNI.
pub struct AndroidHostContext<'a, 'env, 'ctx> {
    env: &'a mut JNIEnv<'env>,
    context: &'a JObject<'ctx>,
}

impl<'a, 'env, 'ctx> AndroidHostContext<'a, 'env, 'ctx> {
    pub fn new(env: &'a mut JNIEnv<'env>, context: &'a JObject<'ctx>) -> Self {
        AndroidHostContext { env, context }
    }
}

impl HostContext for AndroidHostContext<'_, '_, '_> {
    fn own_package(&mut self) -> Option<String> {
        let context = self.context;
        // The local frame drops every JNI reference on all exit paths
        self.env
            .with_local_frame(4, |env| -> jni::errors::Result<Option<String>> {
                let name = env
                    .call_method(context, "getPackageName", "()Ljava/lang/String;", &[])?
                    .l()?;
                if name.as_raw().is_null() {
                    return Ok(None);
                }
                let name = JString::from(name);
                let result = env.get_string(&name)?.to_string_lossy().to_string();
                Ok(Some(result))
            })
            .unwrap_or(None)
    }

    fn installer_of(&mut self, package: &str) -> Option<String> {
        let context = self.context;
        self.env
            .with_local_frame(8, |env| -> jni::errors::Result<Option<String>> {
                let package = env.new_string(package)?;
                let package_obj: &JObject = &package;
                let manager = env
                    .call_method(
                        context,
                        "getPackageManager",
                        "()Landroid/content/pm/PackageManager;",
                        &[],
                    )?
                    .l()?;
                let installer = env
                    .call_method(
                        &manager,
                        "getInstallerPackageName",
                        "(Ljava/lang/String;)Ljava/lang/String;",
                        &[JValue::Object(package_obj)],
                    )?
                    .l()?;
                if installer.as_raw().is_null() {
                    return Ok(None);
                }
                let installer = JString::from(installer);
                let result = env.get_string(&installer)?.to_string_lossy().to_string();
                Ok(Some(result))
            })
            .unwrap_or(None)
    }
}

// ============================================================================
// JNI Bindings
// ============================================================================

/// Initialize logging for Android
#[cfg(target_os = "android")]
#[no_mangle]
pub extern "C" fn Java_com_keyshield_guard_RustEnvironmentGuard_nativeInit(
    _env: JNIEnv,
    _class: JClass,
) {
    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Info)
            .with_tag("RustEnvironmentGuard"),
    );
}

#[cfg(not(target_os = "android"))]
#[no_mangle]
pub extern "C" fn Java_com_keyshield_guard_RustEnvironmentGuard_nativeInit(
    _env: JNIEnv,
    _class: JClass,
) {
    // No-op for non-Android platforms
}

fn run_gate(env: &mut JNIEnv, context: &JObject) -> GuardedKeys {
    let mut host = AndroidHostContext::new(env, context);
    GuardedKeys::initialize(
        &GuardPolicy::builtin(),
        &SystemPropertyStore,
        &ProcCmdline,
        &mut host,
    )
}

/// Verify environment - JNI entry point
///
/// Returns JSON string with EnvironmentReport
#[no_mangle]
pub extern "C" fn Java_com_keyshield_guard_RustEnvironmentGuard_nativeVerifyEnvironment(
    mut env: JNIEnv,
    _class: JClass,
    context: JObject,
) -> jstring {
    let guard = run_gate(&mut env, &context);

    // Serialize to JSON; the fallback literal fails closed
    match serde_json::to_string(guard.report()) {
        Ok(json) => match env.new_string(&json) {
            Ok(jstr) => jstr.into_raw(),
            Err(_) => {
                match env.new_string(
                    r#"{"is_safe":false,"flagged_signals":["Report handoff failed"]}"#,
                ) {
                    Ok(jstr) => jstr.into_raw(),
                    Err(_) => std::ptr::null_mut(),
                }
            }
        },
        Err(_) => {
            match env
                .new_string(r#"{"is_safe":false,"flagged_signals":["Report serialization failed"]}"#)
            {
                Ok(jstr) => jstr.into_raw(),
                Err(_) => std::ptr::null_mut(),
            }
        }
    }
}

/// Safety verdict - JNI entry point
#[no_mangle]
pub extern "C" fn Java_com_keyshield_guard_RustEnvironmentGuard_nativeIsSafeToUse(
    mut env: JNIEnv,
    _class: JClass,
    context: JObject,
) -> jboolean {
    let guard = run_gate(&mut env, &context);
    if guard.is_safe_to_use() {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// Obtain key material - JNI entry point
///
/// Returns IV (16 bytes) + key (32 bytes); zero-filled when the environment
/// is unsafe. Null only if the JVM rejects the array allocation.
#[no_mangle]
pub extern "C" fn Java_com_keyshield_guard_RustEnvironmentGuard_nativeObtainKeyMaterial(
    mut env: JNIEnv,
    _class: JClass,
    context: JObject,
) -> jbyteArray {
    let guard = run_gate(&mut env, &context);

    let mut payload = Vec::with_capacity(AES_IV_SIZE + AES_KEY_SIZE);
    payload.extend_from_slice(guard.initial_vector());
    payload.extend_from_slice(guard.key());

    let result = match env.byte_array_from_slice(&payload) {
        Ok(array) => array.into_raw(),
        Err(_) => std::ptr::null_mut(),
    };

    // Zeroize the native copy after handoff
    payload.zeroize();

    result
}
