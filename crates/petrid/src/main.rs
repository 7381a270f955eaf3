//! petrid launches control-core jobs on this node.
//!
//! This is the process entry the monitor's remote `run/<job>` command
//! spawns. Job flags arrive CLI-style (`--target-rpm 500`) and are handed
//! to the job as string key/values.

use std::collections::BTreeMap;

use clap::{Parser, Subcommand};

use petri_core::automations::AutomationArgs;
use petri_core::automations::dosing::start_dosing_automation;
use petri_core::config::Config;
use petri_core::error::{Error, Result};
use petri_core::growth_rate::start_growth_rate_calculating;
use petri_core::hardware::adc::{Ads1115, Gain, SimAdc};
use petri_core::hardware::dac::{Dac, EightBitDac, RegisterDac, SimDac};
use petri_core::hardware::gpio::{
    CdevEdgeSource, CdevInput, CdevOutput, EdgeSource, GpioInput, GpioOutput, Pull, SimEdgeSource,
    SimInput, SimOutput,
};
use petri_core::hardware::pwm::Pwm;
use petri_core::monitor::{MonitorHardware, start_monitor};
use petri_core::od_reader::start_od_reading;
use petri_core::pump::{BusEventSink, PumpAmount, PumpBank, PumpKind};
use petri_core::stirring::start_stirring;
use petri_core::NodeCtx;

#[derive(Parser)]
#[command(name = "petrid")]
#[command(about = "petri node daemon: run bioreactor control jobs")]
#[command(version = petri_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a named job until it disconnects.
    ///
    /// Trailing flags are passed to the job, e.g.
    /// `petrid run stirring --target-rpm 500`.
    Run {
        /// Job name: monitor, stirring, od_reading, growth_rate_calculating,
        /// dosing_automation, …
        job: String,

        /// Job-specific flags.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a pump by hand: add media, add alt-media, or remove waste.
    Pump {
        /// media, alt_media, or waste
        pump: String,

        #[arg(long)]
        ml: Option<f64>,

        #[arg(long)]
        duration: Option<f64>,

        #[arg(long)]
        continuously: bool,

        #[arg(long, default_value = "cli")]
        source_of_event: String,
    },

    /// List registered automations.
    Automations,
}

/// Parse `--key value` pairs into the kwargs shape jobs take.
fn parse_job_args(args: &[String]) -> BTreeMap<String, String> {
    let mut parsed = BTreeMap::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let Some(key) = arg.strip_prefix("--") else {
            continue;
        };
        let key = key.replace('-', "_");
        let value = match iter.peek() {
            Some(next) if !next.starts_with("--") => iter.next().unwrap().clone(),
            _ => "1".to_string(), // bare flag
        };
        parsed.insert(key, value);
    }
    parsed
}

fn gpio_output(config: &Config, pin: u32) -> Result<Box<dyn GpioOutput>> {
    if config.hardware.simulated {
        Ok(Box::new(SimOutput::new()))
    } else {
        Ok(Box::new(CdevOutput::open(&config.hardware.gpio_chip, pin)?))
    }
}

fn dac(config: &Config) -> Result<Box<dyn Dac>> {
    if config.hardware.simulated {
        return Ok(Box::new(SimDac::new()));
    }
    if config.hardware.dac_eight_bit {
        Ok(Box::new(EightBitDac::open(
            &config.hardware.i2c_bus,
            config.hardware.dac_address,
        )?))
    } else {
        Ok(Box::new(RegisterDac::open(
            &config.hardware.i2c_bus,
            config.hardware.dac_address,
        )?))
    }
}

fn pump_bank(config: &Config, ctx: &NodeCtx) -> Result<PumpBank> {
    let publisher = std::sync::Arc::new(petri_core::bus::BusClient::connect(
        &ctx.leader,
        &format!("{}-pump-{}", ctx.unit, std::process::id()),
        petri_core::bus::BusOptions::default(),
    )?);
    let sink = std::sync::Arc::new(BusEventSink {
        publisher,
        topic: format!(
            "{}/{}/{}/dosing_events",
            ctx.namespace, ctx.unit, ctx.experiment
        ),
    });
    let hardware = config.hardware.clone();
    let simulated = hardware.simulated;
    let chip = hardware.gpio_chip.clone();
    Ok(PumpBank::new(
        ctx.stores.clone(),
        sink,
        hardware.pwm_pins,
        Box::new(move |pin| {
            if simulated {
                Ok(Box::new(SimOutput::new()) as Box<dyn GpioOutput>)
            } else {
                Ok(Box::new(CdevOutput::open(&chip, pin)?) as Box<dyn GpioOutput>)
            }
        }),
    ))
}

fn run_job(job: &str, args: &[String]) -> Result<()> {
    let config = Config::load_default()?;
    let kwargs = AutomationArgs(parse_job_args(args));
    let mut ctx = NodeCtx::from_config(&config);

    petri_core::automations::register_builtins();

    match job {
        "monitor" => {
            let hardware = if config.hardware.simulated {
                MonitorHardware {
                    led: Box::new(SimOutput::new()),
                    button_level: Box::new(SimInput::default()),
                    button_edges: Box::new(SimEdgeSource::steady(0.0)),
                }
            } else {
                MonitorHardware {
                    led: gpio_output(&config, config.hardware.led_pin)?,
                    button_level: Box::new(CdevInput::open(
                        &config.hardware.gpio_chip,
                        config.hardware.button_pin,
                        Pull::Down,
                    )?) as Box<dyn GpioInput>,
                    button_edges: Box::new(CdevEdgeSource::open(
                        &config.hardware.gpio_chip,
                        config.hardware.button_pin,
                        Pull::Down,
                    )?) as Box<dyn EdgeSource>,
                }
            };
            let monitor = start_monitor(ctx, hardware)?;
            monitor.host.set_exit_on_disconnect(true);
            monitor.host.block_until_disconnected();
        }
        "stirring" => {
            resolve_experiment(&mut ctx)?;
            let pwm = Pwm::new(
                config.hardware.pwm_pins.stirring,
                config.stirring.pwm_hz,
                gpio_output(&config, config.hardware.pwm_pins.stirring)?,
            );
            let ignore_rpm = kwargs.get("ignore_rpm").is_some();
            let edge_source: Option<Box<dyn EdgeSource>> = if ignore_rpm {
                None
            } else if config.hardware.simulated {
                Some(Box::new(SimEdgeSource::steady(0.12)))
            } else {
                Some(Box::new(CdevEdgeSource::open(
                    &config.hardware.gpio_chip,
                    config.hardware.hall_sensor_pin,
                    Pull::Up,
                )?))
            };
            let mut stirring_config = config.stirring.clone();
            if let Some(rpm) = kwargs.get_f64("target_rpm") {
                stirring_config.target_rpm = rpm;
            }
            let job = start_stirring(ctx, &stirring_config, pwm, edge_source)?;
            job.host.set_exit_on_disconnect(true);
            job.host.block_until_disconnected();
        }
        "od_reading" => {
            resolve_experiment(&mut ctx)?;
            let adc: Box<dyn petri_core::hardware::Adc> = if config.hardware.simulated {
                Box::new(SimAdc::new(Gain::One, |_, t| {
                    0.1 + 0.02 * (2.0 * std::f64::consts::PI * 60.0 * t).sin()
                }))
            } else {
                Box::new(Ads1115::open(
                    &config.hardware.i2c_bus,
                    config.hardware.adc_address,
                    Gain::Two,
                )?)
            };
            let reader = start_od_reading(ctx, &config.od, adc, dac(&config)?)?;
            reader.host.set_exit_on_disconnect(true);
            reader.host.block_until_disconnected();
        }
        "growth_rate_calculating" => {
            resolve_experiment(&mut ctx)?;
            let ignore_cache = kwargs.get("ignore_cache").is_some();
            let job = start_growth_rate_calculating(ctx, &config.od, ignore_cache)?;
            job.host.set_exit_on_disconnect(true);
            job.host.block_until_disconnected();
        }
        "dosing_automation" => {
            resolve_experiment(&mut ctx)?;
            let automation = kwargs
                .get("automation_name")
                .ok_or_else(|| {
                    Error::InvalidArgument("dosing_automation needs --automation-name".into())
                })?
                .to_string();
            let doser = Box::new(pump_bank(&config, &ctx)?);
            let job = start_dosing_automation(ctx, &config, &automation, &kwargs, doser)?;
            job.host.set_exit_on_disconnect(true);
            job.host.block_until_disconnected();
        }
        "od_normalization" => {
            resolve_experiment(&mut ctx)?;
            let adc: Box<dyn petri_core::hardware::Adc> = if config.hardware.simulated {
                Box::new(SimAdc::new(Gain::One, |_, t| {
                    0.1 + 0.02 * (2.0 * std::f64::consts::PI * 60.0 * t).sin()
                }))
            } else {
                Box::new(Ads1115::open(
                    &config.hardware.i2c_bus,
                    config.hardware.adc_address,
                    Gain::Two,
                )?)
            };
            let specs = petri_core::od_reader::channel_specs(&config.od.angle_to_adc_channel)?;
            let led_channel = petri_core::hardware::LedChannel::parse(&config.od.ir_led_channel)
                .ok_or_else(|| Error::InvalidArgument("bad LED channel".into()))?;
            let mut sampler =
                petri_core::od_reader::OdSampler::new(adc, dac(&config)?, led_channel, specs, &config.od);
            sampler.determine_best_ac_hz()?;

            let n_records = kwargs.get_f64("n_records").unwrap_or(35.0) as usize;
            let (medians, variances) =
                petri_core::od_reader::od_normalization(&mut sampler, &ctx.stores, n_records)?;

            let publisher = std::sync::Arc::new(petri_core::bus::BusClient::connect(
                &ctx.leader,
                &format!("{}-norm-{}", ctx.unit, std::process::id()),
                petri_core::bus::BusOptions::default(),
            )?);
            let base = format!("{}/{}/{}", ctx.namespace, ctx.unit, ctx.experiment);
            publisher.publish(
                &format!("{base}/od_normalization/median"),
                serde_json::to_string(&medians)
                    .map_err(petri_core::Error::from)?
                    .as_bytes(),
                petri_core::bus::Qos::AtLeastOnce,
                true,
            )?;
            publisher.publish(
                &format!("{base}/od_normalization/variance"),
                serde_json::to_string(&variances)
                    .map_err(petri_core::Error::from)?
                    .as_bytes(),
                petri_core::bus::Qos::AtLeastOnce,
                true,
            )?;
            publisher.disconnect();
            log::info!("normalized {} channels over {n_records} records", medians.len());
        }
        "led_automation" => {
            resolve_experiment(&mut ctx)?;
            let automation = kwargs
                .get("automation_name")
                .unwrap_or("silent")
                .to_string();
            let job = petri_core::automations::led::start_led_automation(
                ctx,
                &config,
                &automation,
                &kwargs,
                dac(&config)?,
            )?;
            job.host.set_exit_on_disconnect(true);
            job.host.block_until_disconnected();
        }
        "temperature_automation" => {
            resolve_experiment(&mut ctx)?;
            let automation = kwargs
                .get("automation_name")
                .unwrap_or("silent")
                .to_string();
            let pwm = Pwm::new(
                config.hardware.pwm_pins.heater,
                config.stirring.pwm_hz,
                gpio_output(&config, config.hardware.pwm_pins.heater)?,
            );
            let heater = Box::new(petri_core::automations::temperature::PwmHeater::new(pwm)?);
            let job = petri_core::automations::temperature::start_temperature_automation(
                ctx,
                &config,
                &automation,
                &kwargs,
                heater,
            )?;
            job.host.set_exit_on_disconnect(true);
            job.host.block_until_disconnected();
        }
        other => {
            return Err(Error::InvalidArgument(format!("unknown job {other:?}")));
        }
    }
    Ok(())
}

fn resolve_experiment(ctx: &mut NodeCtx) -> Result<()> {
    let probe = petri_core::bus::BusClient::connect(
        &ctx.leader,
        &format!("{}-whoami-{}", ctx.unit, std::process::id()),
        petri_core::bus::BusOptions::default(),
    )?;
    ctx.resolve_experiment(&probe);
    probe.disconnect();
    Ok(())
}

fn run_pump_command(
    pump: &str,
    ml: Option<f64>,
    duration: Option<f64>,
    continuously: bool,
    source: &str,
) -> Result<()> {
    let config = Config::load_default()?;
    let mut ctx = NodeCtx::from_config(&config);
    resolve_experiment(&mut ctx)?;

    let kind = match pump {
        "media" => PumpKind::Media,
        "alt_media" => PumpKind::AltMedia,
        "waste" => PumpKind::Waste,
        other => {
            return Err(Error::InvalidArgument(format!(
                "unknown pump {other:?}; expected media, alt_media or waste"
            )));
        }
    };
    let amount = match (ml, duration, continuously) {
        (Some(ml), None, false) => PumpAmount::Ml(ml),
        (None, Some(secs), false) => PumpAmount::DurationSecs(secs),
        (None, None, true) => PumpAmount::Continuous,
        _ => {
            return Err(Error::InvalidArgument(
                "pass exactly one of --ml, --duration, --continuously".into(),
            ));
        }
    };

    let bank = pump_bank(&config, &ctx)?;
    let delivered = bank.pump(kind, amount, source)?;
    log::info!("delivered {delivered:.2} ml");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let exit = match &cli.command {
        Commands::Run { job, args } => {
            petri_core::logging::init(job);
            run_job(job, args)
        }
        Commands::Pump {
            pump,
            ml,
            duration,
            continuously,
            source_of_event,
        } => {
            petri_core::logging::init(&format!("pump_{pump}"));
            run_pump_command(pump, *ml, *duration, *continuously, source_of_event)
        }
        Commands::Automations => {
            petri_core::automations::register_builtins();
            for key in petri_core::automations::dosing_keys() {
                println!("{key}");
            }
            Ok(())
        }
    };

    if let Err(e) = exit {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
