//! Daemon state, Wayland dispatch glue and the poll-driven event loop.
//!
//! Single-threaded: Wayland and IPC traffic are processed to quiescence,
//! then dirty outputs are re-rendered and decoded images unloaded.

use std::io;
use std::os::fd::AsRawFd;

use anyhow::{bail, Context as _, Result};
use nix::libc;
use wayland_client::backend::WaylandError;
use wayland_client::protocol::wl_buffer::{self, WlBuffer};
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::protocol::wl_region::WlRegion;
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::protocol::wl_shm::WlShm;
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{
    delegate_noop, Connection, Dispatch, EventQueue, QueueHandle,
};
use wayland_protocols::wp::fractional_scale::v1::client::wp_fractional_scale_manager_v1::WpFractionalScaleManagerV1;
use wayland_protocols::wp::fractional_scale::v1::client::wp_fractional_scale_v1::{
    self, WpFractionalScaleV1,
};
use wayland_protocols::wp::single_pixel_buffer::v1::client::wp_single_pixel_buffer_manager_v1::WpSinglePixelBufferManagerV1;
use wayland_protocols::wp::viewporter::client::wp_viewport::WpViewport;
use wayland_protocols::wp::viewporter::client::wp_viewporter::WpViewporter;
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_shell_v1::{
    Layer, ZwlrLayerShellV1,
};
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_surface_v1::{
    self, Anchor, ZwlrLayerSurfaceV1,
};

use crate::cache::BufferCache;
use crate::config::{resolve_configs, Options, OptionValue};
use crate::image::Image;
use crate::ipc::{SwayIpc, IPC_EVENT_WORKSPACE, IPC_GET_WORKSPACES, IPC_SUBSCRIBE};
use crate::output::{identifier_from_description, rotation_flipped, Output};
use crate::workspaces::{handle_workspace_event, handle_workspaces_reply, Workspace};

pub struct Daemon {
    compositor: Option<WlCompositor>,
    shm: Option<WlShm>,
    layer_shell: Option<ZwlrLayerShellV1>,
    viewporter: Option<WpViewporter>,
    fractional_scale_manager: Option<WpFractionalScaleManagerV1>,
    single_pixel_buffer_manager: Option<WpSinglePixelBufferManagerV1>,

    options: Vec<OptionValue>,
    outputs: Vec<Output>,
    images: Vec<Image>,
    workspaces: Vec<Workspace>,
    cache: BufferCache,
    ipc: SwayIpc,

    qh: QueueHandle<Daemon>,
}

impl Daemon {
    /// Connect to the compositor, bind the globals and bring up the
    /// sway IPC subscription.
    pub fn new(options: Options) -> Result<(Daemon, Connection, EventQueue<Daemon>)> {
        let conn = Connection::connect_to_env().context(
            "Unable to connect to the compositor. If your compositor is running, \
             check or set the WAYLAND_DISPLAY environment variable",
        )?;
        let display = conn.display();
        let mut event_queue = conn.new_event_queue();
        let qh = event_queue.handle();

        let Options { stream, images } = options;
        let mut daemon = Daemon {
            compositor: None,
            shm: None,
            layer_shell: None,
            viewporter: None,
            fractional_scale_manager: None,
            single_pixel_buffer_manager: None,
            options: stream,
            outputs: Vec::new(),
            images,
            workspaces: Vec::new(),
            cache: BufferCache::new(),
            ipc: SwayIpc::closed(),
            qh: qh.clone(),
        };

        display.get_registry(&qh, ());
        event_queue
            .roundtrip(&mut daemon)
            .context("wl_display roundtrip failed")?;

        if daemon.compositor.is_none()
            || daemon.shm.is_none()
            || daemon.layer_shell.is_none()
            || daemon.viewporter.is_none()
        {
            bail!("Missing a required Wayland interface");
        }

        daemon.ipc = SwayIpc::connect();
        daemon.ipc.send(IPC_SUBSCRIBE, Some(r#"["workspace"]"#));
        daemon.ipc.send(IPC_GET_WORKSPACES, None);

        Ok((daemon, conn, event_queue))
    }

    /// Poll the Wayland and IPC fds, dispatch both to quiescence, then
    /// redraw whatever became dirty.
    pub fn run(&mut self, conn: &Connection, event_queue: &mut EventQueue<Daemon>) -> Result<()> {
        log::debug!("Entering event loop");
        while !crate::should_exit() {
            let guard = loop {
                match event_queue.prepare_read() {
                    Some(guard) => break guard,
                    None => {
                        event_queue
                            .dispatch_pending(self)
                            .context("wayland dispatch failed")?;
                    }
                }
            };

            loop {
                match conn.flush() {
                    Ok(()) => break,
                    Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {
                        let mut pfd = libc::pollfd {
                            fd: guard.connection_fd().as_raw_fd(),
                            events: libc::POLLOUT,
                            revents: 0,
                        };
                        if unsafe { libc::poll(&mut pfd, 1, -1) } == -1 {
                            let err = io::Error::last_os_error();
                            if err.raw_os_error() == Some(libc::EINTR) {
                                if crate::should_exit() {
                                    return Ok(());
                                }
                                continue;
                            }
                            bail!("poll failed: {err}");
                        }
                    }
                    Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::BrokenPipe => break,
                    Err(err) => return Err(err).context("wayland connection error"),
                }
            }

            let mut pfds = [
                libc::pollfd {
                    fd: guard.connection_fd().as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    // Negative fds are ignored by poll.
                    fd: self.ipc.raw_fd().unwrap_or(-1),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            loop {
                if unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) } >= 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    if crate::should_exit() {
                        return Ok(());
                    }
                    continue;
                }
                bail!("poll failed: {err}");
            }

            if pfds[0].revents & libc::POLLIN != 0 {
                match guard.read() {
                    Ok(_) => {}
                    Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err).context("failed to read wayland events"),
                }
                event_queue
                    .dispatch_pending(self)
                    .context("wayland dispatch failed")?;
            } else {
                drop(guard);
            }

            if pfds[1].revents & libc::POLLIN != 0 {
                self.handle_ipc();
            }

            self.render();
        }
        Ok(())
    }

    /// Release everything in reverse dependency order: outputs first
    /// (dropping their configs' buffer references), then the option
    /// stream, workspaces and images.
    pub fn teardown(&mut self) {
        for output in std::mem::take(&mut self.outputs) {
            output.destroy();
        }
        self.options.clear();
        self.workspaces.clear();
        self.images.clear();
    }

    fn handle_ipc(&mut self) {
        while let Some(message) = self.ipc.recv() {
            let result = match message.kind {
                IPC_GET_WORKSPACES => handle_workspaces_reply(
                    &message.payload,
                    &mut self.workspaces,
                    &mut self.outputs,
                ),
                IPC_EVENT_WORKSPACE => handle_workspace_event(
                    &message.payload,
                    &mut self.workspaces,
                    &mut self.outputs,
                ),
                _ => Ok(()),
            };
            if let Err(err) = result {
                log::error!("Sway IPC error: {err}");
            }
        }
    }

    /// Redraw pass: outputs with changed buffer inputs rebuild every
    /// config's buffer so workspace switches stay instant, then the
    /// active config is attached and committed.
    fn render(&mut self) {
        for output_index in 0..self.outputs.len() {
            if !self.outputs[output_index].configured {
                continue;
            }
            if self.outputs[output_index].buffer_change {
                for config_index in 0..self.outputs[output_index].configs.len() {
                    self.render_frame(output_index, config_index);
                }
            }
            let output = &self.outputs[output_index];
            if output.buffer_change || output.config_change {
                self.render_buffer(output_index);
                let output = &mut self.outputs[output_index];
                output.buffer_change = false;
                output.config_change = false;
            }
        }

        // Buffers keep the compositor-side pixels alive; the decoded
        // surfaces are only needed while building.
        for image in &mut self.images {
            image.unload();
            image.buffers.retain(|entry| entry.strong_count() > 0);
        }
        self.cache.prune();
    }

    /// Swap one config's buffer for one matching the output's current
    /// pixel dimensions, releasing the previous reference.
    fn render_frame(&mut self, output_index: usize, config_index: usize) {
        let Some(shm) = &self.shm else { return };
        let output = &self.outputs[output_index];
        let (width, height) = output.buffer_size();
        if width < 1 || height < 1 {
            return;
        }
        let buffer = self.cache.get_buffer(
            &output.configs[config_index],
            &mut self.images,
            shm,
            self.single_pixel_buffer_manager.as_ref(),
            &self.qh,
            width,
            height,
        );
        self.outputs[output_index].configs[config_index].buffer = buffer;
    }

    /// Attach the active config's buffer and scale it to the output
    /// through a viewport.
    fn render_buffer(&mut self, output_index: usize) {
        let Some(viewporter) = &self.viewporter else { return };
        let output = &self.outputs[output_index];
        let Some(surface) = &output.surface else { return };
        let Some(config) = output.active_config() else { return };
        let Some(buffer) = &config.buffer else { return };

        surface.attach(Some(buffer.wl_buffer()), 0, 0);
        surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        let viewport = viewporter.get_viewport(surface, &self.qh, ());
        viewport.set_destination(output.width as i32, output.height as i32);
        surface.commit();
        viewport.destroy();
    }

    /// Rebuild the output's config list from the option stream. Runs
    /// whenever the output's name or identifier becomes known.
    fn configure_output(&mut self, index: usize) {
        let output = &self.outputs[index];
        let (name, identifier) = match (&output.name, &output.identifier) {
            (Some(name), Some(identifier)) => (name.as_str(), identifier.as_str()),
            _ => return,
        };
        let visible = self
            .workspaces
            .iter()
            .find(|workspace| workspace.output == name)
            .map(|workspace| workspace.name.as_str());

        let (configs, active) = resolve_configs(&self.options, name, identifier, visible);
        let output = &mut self.outputs[index];
        output.configs = configs;
        output.active = Some(active);
        output.buffer_change = true;
    }

    /// Background layer surface covering the whole output, taking no
    /// input and ignoring reserved space.
    fn create_layer_surface(&mut self, index: usize) {
        let (compositor, layer_shell) = match (&self.compositor, &self.layer_shell) {
            (Some(compositor), Some(layer_shell)) => (compositor.clone(), layer_shell.clone()),
            _ => return,
        };
        let qh = self.qh.clone();

        let surface = compositor.create_surface(&qh, ());
        let input_region = compositor.create_region(&qh, ());
        surface.set_input_region(Some(&input_region));
        input_region.destroy();

        let output = &mut self.outputs[index];
        if let Some(manager) = &self.fractional_scale_manager {
            output.scale_120 = 120;
            output.fractional_scale = Some(manager.get_fractional_scale(&surface, &qh, ()));
        }

        let layer_surface = layer_shell.get_layer_surface(
            &surface,
            Some(&output.wl_output),
            Layer::Background,
            "wallpaper".to_string(),
            &qh,
            (),
        );
        layer_surface.set_size(0, 0);
        layer_surface.set_anchor(Anchor::Top | Anchor::Right | Anchor::Bottom | Anchor::Left);
        layer_surface.set_exclusive_zone(-1);
        surface.commit();

        output.surface = Some(surface);
        output.layer_surface = Some(layer_surface);
    }

    fn destroy_output(&mut self, index: usize) {
        let output = self.outputs.remove(index);
        log::debug!(
            "Destroying output {} ({})",
            output.name.as_deref().unwrap_or("<unnamed>"),
            output.identifier.as_deref().unwrap_or("<unidentified>"),
        );
        output.destroy();
    }
}

impl Dispatch<WlRegistry, ()> for Daemon {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name, interface, ..
            } => match interface.as_str() {
                "wl_compositor" => {
                    state.compositor = Some(registry.bind::<WlCompositor, _, _>(name, 4, qh, ()));
                }
                "wl_shm" => {
                    state.shm = Some(registry.bind::<WlShm, _, _>(name, 1, qh, ()));
                }
                "wl_output" => {
                    let wl_output = registry.bind::<WlOutput, _, _>(name, 4, qh, ());
                    state.outputs.push(Output::new(name, wl_output));
                }
                "zwlr_layer_shell_v1" => {
                    state.layer_shell =
                        Some(registry.bind::<ZwlrLayerShellV1, _, _>(name, 1, qh, ()));
                }
                "wp_viewporter" => {
                    state.viewporter = Some(registry.bind::<WpViewporter, _, _>(name, 1, qh, ()));
                }
                "wp_fractional_scale_manager_v1" => {
                    state.fractional_scale_manager =
                        Some(registry.bind::<WpFractionalScaleManagerV1, _, _>(name, 1, qh, ()));
                }
                "wp_single_pixel_buffer_manager_v1" => {
                    state.single_pixel_buffer_manager =
                        Some(registry.bind::<WpSinglePixelBufferManagerV1, _, _>(name, 1, qh, ()));
                }
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(index) = state.outputs.iter().position(|o| o.wl_name == name) {
                    state.destroy_output(index);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<WlOutput, ()> for Daemon {
    fn event(
        state: &mut Self,
        wl_output: &WlOutput,
        event: wl_output::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(index) = state.outputs.iter().position(|o| &o.wl_output == wl_output) else {
            return;
        };
        match event {
            wl_output::Event::Mode { width, height, .. } => {
                let output = &mut state.outputs[index];
                if output.fractional_scale.is_some() {
                    return;
                }
                if output.mode_width != width || output.mode_height != height {
                    output.mode_width = width;
                    output.mode_height = height;
                    output.buffer_change = true;
                }
            }
            wl_output::Event::Name { name } => {
                {
                    let output = &mut state.outputs[index];
                    if output.name.as_deref() == Some(name.as_str()) {
                        return;
                    }
                    output.name = Some(name);
                    if output.identifier.is_none() {
                        return;
                    }
                }
                state.configure_output(index);
            }
            wl_output::Event::Description { description } => {
                let identifier = identifier_from_description(&description);
                {
                    let output = &mut state.outputs[index];
                    if output.identifier.as_deref() == Some(identifier.as_str()) {
                        return;
                    }
                    output.identifier = Some(identifier);
                    if output.name.is_none() {
                        return;
                    }
                }
                state.configure_output(index);
            }
            wl_output::Event::Done => {
                let output = &state.outputs[index];
                if output.active.is_none() {
                    log::debug!(
                        "Could not find config for output {} ({})",
                        output.name.as_deref().unwrap_or("<unnamed>"),
                        output.identifier.as_deref().unwrap_or("<unidentified>"),
                    );
                    state.destroy_output(index);
                } else if output.layer_surface.is_none() {
                    log::debug!(
                        "Found config for output {} ({})",
                        output.name.as_deref().unwrap_or("<unnamed>"),
                        output.identifier.as_deref().unwrap_or("<unidentified>"),
                    );
                    state.create_layer_surface(index);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwlrLayerSurfaceV1, ()> for Daemon {
    fn event(
        state: &mut Self,
        layer_surface: &ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let Some(index) = state
            .outputs
            .iter()
            .position(|o| o.layer_surface.as_ref() == Some(layer_surface))
        else {
            return;
        };
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                let Some(viewporter) = state.viewporter.clone() else {
                    return;
                };
                let output = &mut state.outputs[index];
                if output.width == width && output.height == height {
                    return;
                }
                if output.fractional_scale.is_some()
                    || rotation_flipped(output.width, output.height, width, height)
                {
                    output.buffer_change = true;
                }
                output.width = width;
                output.height = height;

                if width < 1 || height < 1 {
                    return;
                }
                let Some(surface) = &output.surface else { return };
                layer_surface.ack_configure(serial);
                let viewport = viewporter.get_viewport(surface, qh, ());
                viewport.set_destination(width as i32, height as i32);
                surface.commit();
                output.configured = true;
                viewport.destroy();
            }
            zwlr_layer_surface_v1::Event::Closed => {
                state.destroy_output(index);
            }
            _ => {}
        }
    }
}

impl Dispatch<WpFractionalScaleV1, ()> for Daemon {
    fn event(
        state: &mut Self,
        fractional_scale: &WpFractionalScaleV1,
        event: wp_fractional_scale_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wp_fractional_scale_v1::Event::PreferredScale { scale } = event {
            let output = state
                .outputs
                .iter_mut()
                .find(|o| o.fractional_scale.as_ref() == Some(fractional_scale));
            if let Some(output) = output {
                if output.scale_120 != scale {
                    output.scale_120 = scale;
                    output.buffer_change = true;
                }
            }
        }
    }
}

impl Dispatch<WlBuffer, ()> for Daemon {
    fn event(
        _: &mut Self,
        _: &WlBuffer,
        event: wl_buffer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        // Wallpaper buffers stay attached until replaced; nothing to do
        // when the compositor releases one.
        if let wl_buffer::Event::Release = event {
            log::trace!("Buffer released");
        }
    }
}

delegate_noop!(Daemon: WlCompositor);
delegate_noop!(Daemon: WlShmPool);
delegate_noop!(Daemon: WlRegion);
delegate_noop!(Daemon: WpViewporter);
delegate_noop!(Daemon: WpViewport);
delegate_noop!(Daemon: WpFractionalScaleManagerV1);
delegate_noop!(Daemon: WpSinglePixelBufferManagerV1);
delegate_noop!(Daemon: ZwlrLayerShellV1);
delegate_noop!(Daemon: ignore WlShm);
delegate_noop!(Daemon: ignore WlSurface);
