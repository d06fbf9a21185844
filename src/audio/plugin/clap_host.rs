//! CLAP plugin host implementation
//!
//! Adapts CLAP (CLever Audio Plugin) modules to [`PluginBackend`].
//! CLAP specification: https://github.com/free-audio/clap
//!
//! Only the parts of the ABI the chain needs are declared: entry/factory,
//! the plugin vtable, and the audio-ports, params and gui extensions.

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{AudioError, HostCommands, HostConfig, PluginBackend, PluginInfo, PluginLoader, WindowHandle};

/// CLAP version structure
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

/// CLAP plugin descriptor
#[repr(C)]
pub struct ClapPluginDescriptor {
    pub clap_version: ClapVersion,
    pub id: *const c_char,
    pub name: *const c_char,
    pub vendor: *const c_char,
    pub url: *const c_char,
    pub manual_url: *const c_char,
    pub support_url: *const c_char,
    pub version: *const c_char,
    pub description: *const c_char,
    pub features: *const *const c_char,
}

/// CLAP host structure
#[repr(C)]
pub struct ClapHost {
    pub clap_version: ClapVersion,
    pub host_data: *mut c_void,
    pub name: *const c_char,
    pub vendor: *const c_char,
    pub url: *const c_char,
    pub version: *const c_char,
    pub get_extension: Option<extern "C" fn(*const ClapHost, *const c_char) -> *const c_void>,
    pub request_restart: Option<extern "C" fn(*const ClapHost)>,
    pub request_process: Option<extern "C" fn(*const ClapHost)>,
    pub request_callback: Option<extern "C" fn(*const ClapHost)>,
}

/// CLAP plugin structure
#[repr(C)]
pub struct ClapPlugin {
    pub desc: *const ClapPluginDescriptor,
    pub plugin_data: *mut c_void,
    pub init: Option<extern "C" fn(*const ClapPlugin) -> bool>,
    pub destroy: Option<extern "C" fn(*const ClapPlugin)>,
    pub activate: Option<
        extern "C" fn(
            *const ClapPlugin,
            sample_rate: f64,
            min_frames: u32,
            max_frames: u32,
        ) -> bool,
    >,
    pub deactivate: Option<extern "C" fn(*const ClapPlugin)>,
    pub start_processing: Option<extern "C" fn(*const ClapPlugin) -> bool>,
    pub stop_processing: Option<extern "C" fn(*const ClapPlugin)>,
    pub reset: Option<extern "C" fn(*const ClapPlugin)>,
    pub process: Option<extern "C" fn(*const ClapPlugin, *const ClapProcess) -> ClapProcessStatus>,
    pub get_extension: Option<extern "C" fn(*const ClapPlugin, *const c_char) -> *const c_void>,
    pub on_main_thread: Option<extern "C" fn(*const ClapPlugin)>,
}

/// CLAP process status
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClapProcessStatus {
    Error = 0,
    Continue = 1,
    ContinueIfNotQuiet = 2,
    Tail = 3,
    Sleep = 4,
}

/// CLAP process structure
#[repr(C)]
pub struct ClapProcess {
    pub steady_time: i64,
    pub frames_count: u32,
    pub transport: *const c_void,
    pub audio_inputs: *const ClapAudioBuffer,
    pub audio_outputs: *mut ClapAudioBuffer,
    pub audio_inputs_count: u32,
    pub audio_outputs_count: u32,
    pub in_events: *const ClapInputEvents,
    pub out_events: *const ClapOutputEvents,
}

/// CLAP audio buffer
#[repr(C)]
pub struct ClapAudioBuffer {
    pub data32: *mut *mut f32,
    pub data64: *mut *mut f64,
    pub channel_count: u32,
    pub latency: u32,
    pub constant_mask: u64,
}

/// CLAP plugin entry point
#[repr(C)]
pub struct ClapPluginEntry {
    pub clap_version: ClapVersion,
    pub init: Option<extern "C" fn(*const c_char) -> bool>,
    pub deinit: Option<extern "C" fn()>,
    pub get_factory: Option<extern "C" fn(*const c_char) -> *const c_void>,
}

/// CLAP plugin factory
#[repr(C)]
pub struct ClapPluginFactory {
    pub get_plugin_count: Option<extern "C" fn(*const ClapPluginFactory) -> u32>,
    pub get_plugin_descriptor:
        Option<extern "C" fn(*const ClapPluginFactory, u32) -> *const ClapPluginDescriptor>,
    pub create_plugin: Option<
        extern "C" fn(
            *const ClapPluginFactory,
            *const ClapHost,
            *const c_char,
        ) -> *const ClapPlugin,
    >,
}

/// Common header of every CLAP event
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapEventHeader {
    pub size: u32,
    pub time: u32,
    pub space_id: u16,
    pub event_type: u16,
    pub flags: u32,
}

/// CLAP parameter value event
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapEventParamValue {
    pub header: ClapEventHeader,
    pub param_id: u32,
    pub cookie: *mut c_void,
    pub note_id: i32,
    pub port_index: i16,
    pub channel: i16,
    pub key: i16,
    pub value: f64,
}

/// CLAP parameter gesture begin/end event
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapEventParamGesture {
    pub header: ClapEventHeader,
    pub param_id: u32,
}

/// Host-provided input event list
#[repr(C)]
pub struct ClapInputEvents {
    pub ctx: *mut c_void,
    pub size: Option<extern "C" fn(*const ClapInputEvents) -> u32>,
    pub get: Option<extern "C" fn(*const ClapInputEvents, u32) -> *const ClapEventHeader>,
}

/// Host-provided output event sink
#[repr(C)]
pub struct ClapOutputEvents {
    pub ctx: *mut c_void,
    pub try_push: Option<extern "C" fn(*const ClapOutputEvents, *const ClapEventHeader) -> bool>,
}

/// Audio port description from the audio-ports extension
#[repr(C)]
pub struct ClapAudioPortInfo {
    pub id: u32,
    pub name: [c_char; 256],
    pub flags: u32,
    pub channel_count: u32,
    pub port_type: *const c_char,
    pub in_place_pair: u32,
}

/// Plugin audio-ports extension
#[repr(C)]
pub struct ClapPluginAudioPorts {
    pub count: Option<extern "C" fn(*const ClapPlugin, bool) -> u32>,
    pub get: Option<extern "C" fn(*const ClapPlugin, u32, bool, *mut ClapAudioPortInfo) -> bool>,
}

/// Parameter description from the params extension
#[repr(C)]
pub struct ClapParamInfo {
    pub id: u32,
    pub flags: u32,
    pub cookie: *mut c_void,
    pub name: [c_char; 256],
    pub module: [c_char; 1024],
    pub min_value: f64,
    pub max_value: f64,
    pub default_value: f64,
}

/// Plugin params extension
#[repr(C)]
pub struct ClapPluginParams {
    pub count: Option<extern "C" fn(*const ClapPlugin) -> u32>,
    pub get_info: Option<extern "C" fn(*const ClapPlugin, u32, *mut ClapParamInfo) -> bool>,
    pub get_value: Option<extern "C" fn(*const ClapPlugin, u32, *mut f64) -> bool>,
    pub value_to_text:
        Option<extern "C" fn(*const ClapPlugin, u32, f64, *mut c_char, u32) -> bool>,
    pub text_to_value:
        Option<extern "C" fn(*const ClapPlugin, u32, *const c_char, *mut f64) -> bool>,
    pub flush:
        Option<extern "C" fn(*const ClapPlugin, *const ClapInputEvents, *const ClapOutputEvents)>,
}

/// Native window reference passed to the gui extension
#[repr(C)]
pub struct ClapWindow {
    pub api: *const c_char,
    pub handle: *mut c_void,
}

/// Plugin gui extension
#[repr(C)]
pub struct ClapPluginGui {
    pub is_api_supported: Option<extern "C" fn(*const ClapPlugin, *const c_char, bool) -> bool>,
    pub get_preferred_api:
        Option<extern "C" fn(*const ClapPlugin, *mut *const c_char, *mut bool) -> bool>,
    pub create: Option<extern "C" fn(*const ClapPlugin, *const c_char, bool) -> bool>,
    pub destroy: Option<extern "C" fn(*const ClapPlugin)>,
    pub set_scale: Option<extern "C" fn(*const ClapPlugin, f64) -> bool>,
    pub get_size: Option<extern "C" fn(*const ClapPlugin, *mut u32, *mut u32) -> bool>,
    pub can_resize: Option<extern "C" fn(*const ClapPlugin) -> bool>,
    pub get_resize_hints: Option<extern "C" fn(*const ClapPlugin, *mut c_void) -> bool>,
    pub adjust_size: Option<extern "C" fn(*const ClapPlugin, *mut u32, *mut u32) -> bool>,
    pub set_size: Option<extern "C" fn(*const ClapPlugin, u32, u32) -> bool>,
    pub set_parent: Option<extern "C" fn(*const ClapPlugin, *const ClapWindow) -> bool>,
    pub set_transient: Option<extern "C" fn(*const ClapPlugin, *const ClapWindow) -> bool>,
    pub suggest_title: Option<extern "C" fn(*const ClapPlugin, *const c_char)>,
    pub show: Option<extern "C" fn(*const ClapPlugin) -> bool>,
    pub hide: Option<extern "C" fn(*const ClapPlugin) -> bool>,
}

/// Host params extension
#[repr(C)]
pub struct ClapHostParams {
    pub rescan: Option<extern "C" fn(*const ClapHost, u32)>,
    pub clear: Option<extern "C" fn(*const ClapHost, u32, u32)>,
    pub request_flush: Option<extern "C" fn(*const ClapHost)>,
}

/// Host gui extension
#[repr(C)]
pub struct ClapHostGui {
    pub resize_hints_changed: Option<extern "C" fn(*const ClapHost)>,
    pub request_resize: Option<extern "C" fn(*const ClapHost, u32, u32) -> bool>,
    pub request_show: Option<extern "C" fn(*const ClapHost) -> bool>,
    pub request_hide: Option<extern "C" fn(*const ClapHost) -> bool>,
    pub closed: Option<extern "C" fn(*const ClapHost, bool)>,
}

const CLAP_PLUGIN_FACTORY_ID: &[u8] = b"clap.plugin-factory\0";
const CLAP_EXT_AUDIO_PORTS: &[u8] = b"clap.audio-ports\0";
const CLAP_EXT_PARAMS: &[u8] = b"clap.params\0";
const CLAP_EXT_GUI: &[u8] = b"clap.gui\0";

const CLAP_CORE_EVENT_SPACE_ID: u16 = 0;
const CLAP_EVENT_PARAM_VALUE: u16 = 5;
const CLAP_EVENT_PARAM_GESTURE_BEGIN: u16 = 6;
const CLAP_EVENT_PARAM_GESTURE_END: u16 = 7;

#[cfg(target_os = "windows")]
const CLAP_WINDOW_API: &[u8] = b"win32\0";
#[cfg(target_os = "macos")]
const CLAP_WINDOW_API: &[u8] = b"cocoa\0";
#[cfg(all(unix, not(target_os = "macos")))]
const CLAP_WINDOW_API: &[u8] = b"x11\0";

const DISPLAY_CAPACITY: usize = 256;

/// Loads CLAP modules from disk
#[derive(Debug, Default, Clone, Copy)]
pub struct ClapLoader;

impl ClapLoader {
    pub fn new() -> Self {
        Self
    }
}

impl PluginLoader for ClapLoader {
    fn load(&self, path: &Path, config: HostConfig) -> Result<Box<dyn PluginBackend>, AudioError> {
        if !path.exists() {
            return Err(AudioError::PluginLoad(format!(
                "Plugin not found: {}",
                path.display()
            )));
        }

        let library = ClapLibrary::open(path).map_err(|e| {
            AudioError::PluginLoad(format!("{}: {}", path.display(), e))
        })?;
        let instance = ClapPluginInstance::create(Arc::new(library), 0, config).map_err(|e| {
            AudioError::PluginLoad(format!("{}: {}", path.display(), e))
        })?;
        Ok(Box::new(instance))
    }

    fn unload(&self, plugin: Box<dyn PluginBackend>) {
        let name = plugin.info().name.clone();
        drop(plugin);
        debug!("Unloaded CLAP plugin: {}", name);
    }
}

/// An opened CLAP module
struct ClapLibrary {
    #[allow(dead_code)]
    library: Library,
    entry: *const ClapPluginEntry,
    factory: *const ClapPluginFactory,
    path: String,
}

// SAFETY: the entry and factory are immutable tables owned by the module
unsafe impl Send for ClapLibrary {}
unsafe impl Sync for ClapLibrary {}

impl ClapLibrary {
    fn open(path: &Path) -> Result<Self, AudioError> {
        let path_str = path.to_string_lossy().to_string();

        let library = unsafe {
            Library::new(path).map_err(|e| {
                AudioError::PluginError(format!("Failed to load library {}: {}", path_str, e))
            })?
        };

        let entry: Symbol<*const ClapPluginEntry> = unsafe {
            library
                .get(b"clap_entry")
                .map_err(|e| AudioError::PluginError(format!("Failed to find clap_entry: {}", e)))?
        };

        let entry = *entry;
        if entry.is_null() {
            return Err(AudioError::PluginError("clap_entry is null".to_string()));
        }

        let factory = init_entry(unsafe { &*entry }, &path_str)?;

        info!("Loaded CLAP module: {}", path_str);

        Ok(Self {
            library,
            entry,
            factory,
            path: path_str,
        })
    }

    fn descriptor(&self, index: u32) -> Option<&ClapPluginDescriptor> {
        let factory = unsafe { &*self.factory };
        let get_desc = factory.get_plugin_descriptor?;
        let desc_ptr = get_desc(self.factory, index);
        if desc_ptr.is_null() {
            return None;
        }
        Some(unsafe { &*desc_ptr })
    }
}

/// Initialize the module and fetch its plugin factory.
///
/// Once `init` has succeeded, every failure calls `deinit` before returning.
fn init_entry(entry: &ClapPluginEntry, path: &str) -> Result<*const ClapPluginFactory, AudioError> {
    if let Some(init) = entry.init {
        let path_cstr = CString::new(path)
            .map_err(|_| AudioError::PluginError("Invalid path string".to_string()))?;
        if !init(path_cstr.as_ptr()) {
            return Err(AudioError::PluginError("Plugin init failed".to_string()));
        }
    }

    let factory = entry
        .get_factory
        .map_or(ptr::null(), |get_factory| {
            get_factory(CLAP_PLUGIN_FACTORY_ID.as_ptr() as *const c_char)
        });
    if factory.is_null() {
        if let Some(deinit) = entry.deinit {
            deinit();
        }
        let reason = if entry.get_factory.is_none() {
            "No get_factory function"
        } else {
            "Failed to get plugin factory"
        };
        return Err(AudioError::PluginError(reason.to_string()));
    }
    Ok(factory as *const ClapPluginFactory)
}

impl Drop for ClapLibrary {
    fn drop(&mut self) {
        let entry = unsafe { &*self.entry };
        if let Some(deinit) = entry.deinit {
            deinit();
        }
        debug!("Closed CLAP module: {}", self.path);
    }
}

fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string()
}

/// Create a host structure whose callbacks route to `commands`
fn create_host(commands: &HostCommands) -> ClapHost {
    static HOST_URL: &[u8] = b"\0";
    let (name, vendor, version) = commands.identity();

    ClapHost {
        clap_version: ClapVersion {
            major: 1,
            minor: 2,
            revision: 0,
        },
        host_data: commands as *const HostCommands as *mut c_void,
        name: name.as_ptr(),
        vendor: vendor.as_ptr(),
        url: HOST_URL.as_ptr() as *const c_char,
        version: version.as_ptr(),
        get_extension: Some(host_get_extension),
        request_restart: Some(host_request_restart),
        request_process: Some(host_request_process),
        request_callback: Some(host_request_callback),
    }
}

fn host_commands<'a>(host: *const ClapHost) -> Option<&'a HostCommands> {
    if host.is_null() {
        return None;
    }
    let data = unsafe { (*host).host_data } as *const HostCommands;
    unsafe { data.as_ref() }
}

static HOST_PARAMS: ClapHostParams = ClapHostParams {
    rescan: Some(host_params_rescan),
    clear: Some(host_params_clear),
    request_flush: Some(host_params_request_flush),
};

static HOST_GUI: ClapHostGui = ClapHostGui {
    resize_hints_changed: Some(host_gui_resize_hints_changed),
    request_resize: Some(host_gui_request_resize),
    request_show: Some(host_gui_request_show),
    request_hide: Some(host_gui_request_hide),
    closed: Some(host_gui_closed),
};

extern "C" fn host_get_extension(
    _host: *const ClapHost,
    extension_id: *const c_char,
) -> *const c_void {
    if extension_id.is_null() {
        return ptr::null();
    }
    let id = unsafe { CStr::from_ptr(extension_id) }.to_bytes_with_nul();
    if id == CLAP_EXT_PARAMS {
        &HOST_PARAMS as *const ClapHostParams as *const c_void
    } else if id == CLAP_EXT_GUI {
        &HOST_GUI as *const ClapHostGui as *const c_void
    } else {
        ptr::null()
    }
}

extern "C" fn host_request_restart(host: *const ClapHost) {
    if let Some(commands) = host_commands(host) {
        commands.request_restart();
    }
}

extern "C" fn host_request_process(host: *const ClapHost) {
    if let Some(commands) = host_commands(host) {
        commands.request_process();
    }
}

extern "C" fn host_request_callback(host: *const ClapHost) {
    if let Some(commands) = host_commands(host) {
        commands.request_callback();
    }
}

extern "C" fn host_params_rescan(host: *const ClapHost, _flags: u32) {
    if let Some(commands) = host_commands(host) {
        commands.update_display();
    }
}

extern "C" fn host_params_clear(_host: *const ClapHost, _param_id: u32, _flags: u32) {}

extern "C" fn host_params_request_flush(host: *const ClapHost) {
    if let Some(commands) = host_commands(host) {
        commands.request_flush();
    }
}

extern "C" fn host_gui_resize_hints_changed(_host: *const ClapHost) {}

extern "C" fn host_gui_request_resize(host: *const ClapHost, width: u32, height: u32) -> bool {
    host_commands(host)
        .map(|commands| commands.size_window(width, height))
        .unwrap_or(false)
}

extern "C" fn host_gui_request_show(_host: *const ClapHost) -> bool {
    false
}

extern "C" fn host_gui_request_hide(_host: *const ClapHost) -> bool {
    false
}

extern "C" fn host_gui_closed(host: *const ClapHost, _was_destroyed: bool) {
    if let Some(commands) = host_commands(host) {
        commands.process_idle();
    }
}

extern "C" fn input_events_size(list: *const ClapInputEvents) -> u32 {
    let events = unsafe { (*list).ctx } as *const Vec<ClapEventParamValue>;
    unsafe { events.as_ref() }.map_or(0, |events| events.len() as u32)
}

extern "C" fn input_events_get(list: *const ClapInputEvents, index: u32) -> *const ClapEventHeader {
    let events = unsafe { (*list).ctx } as *const Vec<ClapEventParamValue>;
    match unsafe { events.as_ref() }.and_then(|events| events.get(index as usize)) {
        Some(event) => &event.header as *const ClapEventHeader,
        None => ptr::null(),
    }
}

extern "C" fn output_events_try_push(
    list: *const ClapOutputEvents,
    event: *const ClapEventHeader,
) -> bool {
    if event.is_null() {
        return false;
    }
    let commands = unsafe { ((*list).ctx as *const HostCommands).as_ref() };
    let header = unsafe { &*event };
    let Some(commands) = commands else {
        return true;
    };
    if header.space_id != CLAP_CORE_EVENT_SPACE_ID {
        return true;
    }
    match header.event_type {
        CLAP_EVENT_PARAM_VALUE => {
            let value = unsafe { &*(event as *const ClapEventParamValue) };
            commands.parameter_automated(value.param_id as usize, value.value as f32);
        }
        CLAP_EVENT_PARAM_GESTURE_BEGIN => {
            let gesture = unsafe { &*(event as *const ClapEventParamGesture) };
            commands.begin_edit(gesture.param_id as usize);
        }
        CLAP_EVENT_PARAM_GESTURE_END => {
            let gesture = unsafe { &*(event as *const ClapEventParamGesture) };
            commands.end_edit(gesture.param_id as usize);
        }
        _ => {}
    }
    true
}

fn param_value_event(param_id: u32, value: f64) -> ClapEventParamValue {
    ClapEventParamValue {
        header: ClapEventHeader {
            size: std::mem::size_of::<ClapEventParamValue>() as u32,
            time: 0,
            space_id: CLAP_CORE_EVENT_SPACE_ID,
            event_type: CLAP_EVENT_PARAM_VALUE,
            flags: 0,
        },
        param_id,
        cookie: ptr::null_mut(),
        note_id: -1,
        port_index: -1,
        channel: -1,
        key: -1,
        value,
    }
}

/// Parameter range as reported by the plugin
#[derive(Debug, Clone)]
struct ClapParam {
    id: u32,
    name: String,
    min: f64,
    max: f64,
}

impl ClapParam {
    fn normalize(&self, plain: f64) -> f32 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0.0;
        }
        ((plain - self.min) / span).clamp(0.0, 1.0) as f32
    }

    fn denormalize(&self, normalized: f32) -> f64 {
        self.min + (normalized as f64).clamp(0.0, 1.0) * (self.max - self.min)
    }
}

/// CLAP plugin instance
pub struct ClapPluginInstance {
    plugin: *const ClapPlugin,
    host: Box<ClapHost>,
    commands: Box<HostCommands>,
    info: PluginInfo,
    params: Vec<ClapParam>,
    params_ext: *const ClapPluginParams,
    gui_ext: *const ClapPluginGui,
    pending: Mutex<Vec<(u32, f64)>>,
    activated: AtomicBool,
    processing: AtomicBool,
    gui_created: AtomicBool,
    // Declared last so the module outlives the plugin it created
    _library: Arc<ClapLibrary>,
}

// SAFETY: the plugin pointer is only used through the CLAP thread-safety
// contract; host-side mutable state lives behind atomics and a mutex
unsafe impl Send for ClapPluginInstance {}
unsafe impl Sync for ClapPluginInstance {}

impl ClapPluginInstance {
    fn create(library: Arc<ClapLibrary>, index: u32, config: HostConfig) -> Result<Self, AudioError> {
        let factory = unsafe { &*library.factory };

        let desc = library
            .descriptor(index)
            .ok_or_else(|| AudioError::PluginError("Plugin descriptor is null".to_string()))?;
        let name = c_string(desc.name);
        let vendor = c_string(desc.vendor);
        let version = c_string(desc.version);
        let uid = c_string(desc.id);

        let commands = Box::new(HostCommands::new(config));
        commands.set_plugin_id(&uid);
        let host = Box::new(create_host(&commands));

        let create = factory
            .create_plugin
            .ok_or_else(|| AudioError::PluginError("No create_plugin function".to_string()))?;

        let plugin_ptr = create(library.factory, &*host as *const ClapHost, desc.id);
        if plugin_ptr.is_null() {
            return Err(AudioError::PluginError(
                "Failed to create plugin instance".to_string(),
            ));
        }

        let plugin = unsafe { &*plugin_ptr };
        if let Some(init) = plugin.init {
            if !init(plugin_ptr) {
                if let Some(destroy) = plugin.destroy {
                    destroy(plugin_ptr);
                }
                return Err(AudioError::PluginError("Plugin init failed".to_string()));
            }
        }

        let extension = |id: &[u8]| -> *const c_void {
            match plugin.get_extension {
                Some(get) => get(plugin_ptr, id.as_ptr() as *const c_char),
                None => ptr::null(),
            }
        };
        let ports_ext = extension(CLAP_EXT_AUDIO_PORTS) as *const ClapPluginAudioPorts;
        let params_ext = extension(CLAP_EXT_PARAMS) as *const ClapPluginParams;
        let gui_ext = extension(CLAP_EXT_GUI) as *const ClapPluginGui;

        let (num_inputs, num_outputs) = main_port_channels(plugin_ptr, ports_ext);
        let params = query_params(plugin_ptr, params_ext);

        let info = PluginInfo {
            name,
            vendor,
            version,
            path: library.path.clone(),
            uid,
            num_inputs,
            num_outputs,
            num_parameters: params.len(),
            has_editor: !gui_ext.is_null(),
        };

        info!("Instantiated CLAP plugin: {}", info.name);

        Ok(Self {
            plugin: plugin_ptr,
            host,
            commands,
            info,
            params,
            params_ext,
            gui_ext,
            pending: Mutex::new(Vec::new()),
            activated: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            gui_created: AtomicBool::new(false),
            _library: library,
        })
    }

    fn vtable(&self) -> &ClapPlugin {
        unsafe { &*self.plugin }
    }

    fn params_ext(&self) -> Option<&ClapPluginParams> {
        unsafe { self.params_ext.as_ref() }
    }

    fn gui_ext(&self) -> Option<&ClapPluginGui> {
        unsafe { self.gui_ext.as_ref() }
    }

    fn output_events(&self) -> ClapOutputEvents {
        ClapOutputEvents {
            ctx: &*self.commands as *const HostCommands as *mut c_void,
            try_push: Some(output_events_try_push),
        }
    }

    /// Current plain value, preferring a change not yet delivered to the plugin
    fn plain_value(&self, param: &ClapParam) -> f64 {
        if let Some(&(_, value)) = self.pending.lock().iter().rev().find(|(id, _)| *id == param.id) {
            return value;
        }
        let mut value = param.min;
        if let Some(get_value) = self.params_ext().and_then(|ext| ext.get_value) {
            if !get_value(self.plugin, param.id, &mut value) {
                value = param.min;
            }
        }
        value
    }

    /// Deliver queued parameter changes through the params flush entry point
    fn flush_pending(&self) {
        let events: Vec<ClapEventParamValue> = self
            .pending
            .lock()
            .drain(..)
            .map(|(id, value)| param_value_event(id, value))
            .collect();
        if events.is_empty() && !self.commands.take_flush_request() {
            return;
        }
        let Some(flush) = self.params_ext().and_then(|ext| ext.flush) else {
            return;
        };
        let in_events = ClapInputEvents {
            ctx: &events as *const Vec<ClapEventParamValue> as *mut c_void,
            size: Some(input_events_size),
            get: Some(input_events_get),
        };
        let out_events = self.output_events();
        flush(self.plugin, &in_events, &out_events);
    }
}

fn main_port_channels(plugin: *const ClapPlugin, ports: *const ClapPluginAudioPorts) -> (usize, usize) {
    let Some(ports) = (unsafe { ports.as_ref() }) else {
        // Without the extension assume a stereo effect
        return (2, 2);
    };
    let channels = |is_input: bool| -> usize {
        let count = ports.count.map_or(0, |count| count(plugin, is_input));
        if count == 0 {
            return 0;
        }
        let Some(get) = ports.get else {
            return 2;
        };
        let mut info = ClapAudioPortInfo {
            id: 0,
            name: [0; 256],
            flags: 0,
            channel_count: 0,
            port_type: ptr::null(),
            in_place_pair: 0,
        };
        if get(plugin, 0, is_input, &mut info) {
            info.channel_count as usize
        } else {
            2
        }
    };
    (channels(true), channels(false))
}

fn query_params(plugin: *const ClapPlugin, params: *const ClapPluginParams) -> Vec<ClapParam> {
    let Some(params) = (unsafe { params.as_ref() }) else {
        return Vec::new();
    };
    let (Some(count), Some(get_info)) = (params.count, params.get_info) else {
        return Vec::new();
    };

    (0..count(plugin))
        .filter_map(|index| {
            let mut info = ClapParamInfo {
                id: 0,
                flags: 0,
                cookie: ptr::null_mut(),
                name: [0; 256],
                module: [0; 1024],
                min_value: 0.0,
                max_value: 1.0,
                default_value: 0.0,
            };
            if !get_info(plugin, index, &mut info) {
                warn!("Plugin refused info for parameter {}", index);
                return None;
            }
            Some(ClapParam {
                id: info.id,
                name: c_string(info.name.as_ptr()),
                min: info.min_value,
                max: info.max_value,
            })
        })
        .collect()
}

impl PluginBackend for ClapPluginInstance {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn configure(&self, config: &HostConfig) -> Result<(), AudioError> {
        if self.activated.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.commands.set_config(*config);
        let frames = self.commands.block_size() as u32;
        let sample_rate = self.commands.sample_rate();
        if let Some(activate) = self.vtable().activate {
            if !activate(self.plugin, sample_rate as f64, frames, frames) {
                return Err(AudioError::PluginError(
                    "Plugin activation failed".to_string(),
                ));
            }
        }
        self.activated.store(true, Ordering::SeqCst);
        info!(
            "Activated CLAP plugin: {} ({} Hz, {} frames)",
            self.info.name, sample_rate, frames
        );
        Ok(())
    }

    fn start_processing(&self) -> Result<(), AudioError> {
        if self.processing.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.flush_pending();
        if let Some(start) = self.vtable().start_processing {
            if !start(self.plugin) {
                return Err(AudioError::PluginError(
                    "Plugin start_processing failed".to_string(),
                ));
            }
        }
        self.processing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_processing(&self) {
        if !self.processing.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(stop) = self.vtable().stop_processing {
            stop(self.plugin);
        }
    }

    fn parameter_name(&self, index: usize) -> String {
        self.params
            .get(index)
            .map(|param| param.name.clone())
            .unwrap_or_default()
    }

    fn parameter_display(&self, index: usize) -> String {
        let Some(param) = self.params.get(index) else {
            return String::new();
        };
        let plain = self.plain_value(param);
        if let Some(to_text) = self.params_ext().and_then(|ext| ext.value_to_text) {
            let mut buffer = [0 as c_char; DISPLAY_CAPACITY];
            if to_text(
                self.plugin,
                param.id,
                plain,
                buffer.as_mut_ptr(),
                DISPLAY_CAPACITY as u32,
            ) {
                buffer[DISPLAY_CAPACITY - 1] = 0;
                return c_string(buffer.as_ptr());
            }
        }
        format!("{:.3}", plain)
    }

    fn parameter_label(&self, _index: usize) -> String {
        // CLAP folds the unit into value_to_text
        String::new()
    }

    fn get_parameter(&self, index: usize) -> f32 {
        self.params
            .get(index)
            .map(|param| param.normalize(self.plain_value(param)))
            .unwrap_or(0.0)
    }

    fn set_parameter(&self, index: usize, value: f32) {
        let Some(param) = self.params.get(index) else {
            return;
        };
        self.pending.lock().push((param.id, param.denormalize(value)));
        // While processing, the queue is delivered with the next block
        if !self.processing.load(Ordering::SeqCst) {
            self.flush_pending();
        }
    }

    fn process_replacing(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
        if !self.activated.load(Ordering::SeqCst) || !self.processing.load(Ordering::SeqCst) {
            return;
        }
        let Some(process_fn) = self.vtable().process else {
            return;
        };
        if frames == 0 {
            return;
        }

        let events: Vec<ClapEventParamValue> = self
            .pending
            .lock()
            .drain(..)
            .map(|(id, value)| param_value_event(id, value))
            .collect();
        let in_events = ClapInputEvents {
            ctx: &events as *const Vec<ClapEventParamValue> as *mut c_void,
            size: Some(input_events_size),
            get: Some(input_events_get),
        };
        let out_events = self.output_events();

        let mut input_ptrs: Vec<*mut f32> =
            inputs.iter().map(|ch| ch.as_ptr() as *mut f32).collect();
        let mut output_ptrs: Vec<*mut f32> = outputs.iter_mut().map(|ch| ch.as_mut_ptr()).collect();

        let input_buffer = ClapAudioBuffer {
            data32: input_ptrs.as_mut_ptr(),
            data64: ptr::null_mut(),
            channel_count: inputs.len() as u32,
            latency: 0,
            constant_mask: 0,
        };

        let mut output_buffer = ClapAudioBuffer {
            data32: output_ptrs.as_mut_ptr(),
            data64: ptr::null_mut(),
            channel_count: outputs.len() as u32,
            latency: 0,
            constant_mask: 0,
        };

        let process = ClapProcess {
            steady_time: -1,
            frames_count: frames as u32,
            transport: ptr::null(),
            audio_inputs: &input_buffer,
            audio_outputs: &mut output_buffer,
            audio_inputs_count: u32::from(!inputs.is_empty()),
            audio_outputs_count: u32::from(!outputs.is_empty()),
            in_events: &in_events,
            out_events: &out_events,
        };

        let status = process_fn(self.plugin, &process);
        if status == ClapProcessStatus::Error {
            trace!("CLAP plugin {} reported a process error", self.info.name);
        }
    }

    fn open_editor(&self, parent: WindowHandle) -> Result<(), AudioError> {
        let gui = self
            .gui_ext()
            .ok_or_else(|| AudioError::PluginError("Editor not supported".to_string()))?;
        let api = CLAP_WINDOW_API.as_ptr() as *const c_char;

        if let Some(supported) = gui.is_api_supported {
            if !supported(self.plugin, api, false) {
                return Err(AudioError::PluginError(
                    "Editor does not support embedding on this platform".to_string(),
                ));
            }
        }
        let create = gui
            .create
            .ok_or_else(|| AudioError::PluginError("Editor cannot be created".to_string()))?;
        if !create(self.plugin, api, false) {
            return Err(AudioError::PluginError("Editor creation failed".to_string()));
        }
        self.gui_created.store(true, Ordering::SeqCst);

        let window = ClapWindow {
            api,
            handle: parent.0,
        };
        if let Some(set_parent) = gui.set_parent {
            if !set_parent(self.plugin, &window) {
                self.close_editor();
                return Err(AudioError::PluginError(
                    "Editor rejected parent window".to_string(),
                ));
            }
        }
        if let Some(show) = gui.show {
            show(self.plugin);
        }
        Ok(())
    }

    fn close_editor(&self) {
        if !self.gui_created.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(gui) = self.gui_ext() {
            if let Some(hide) = gui.hide {
                hide(self.plugin);
            }
            if let Some(destroy) = gui.destroy {
                destroy(self.plugin);
            }
        }
    }

    fn editor_idle(&self) {
        if self.commands.take_callback_request() {
            if let Some(on_main_thread) = self.vtable().on_main_thread {
                on_main_thread(self.plugin);
            }
        }
        self.commands.process_idle();
    }
}

impl Drop for ClapPluginInstance {
    fn drop(&mut self) {
        self.close_editor();
        self.stop_processing();

        let plugin = self.vtable();
        if self.activated.swap(false, Ordering::SeqCst) {
            if let Some(deactivate) = plugin.deactivate {
                deactivate(self.plugin);
            }
        }
        if let Some(destroy) = plugin.destroy {
            destroy(self.plugin);
        }
        debug!("Destroyed CLAP plugin instance: {}", self.info.name);
    }
}
