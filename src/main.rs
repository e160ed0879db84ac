use clap::{App, Arg};
use log::debug;

use jtagprog::board::{board_by_name, FlashKind};
use jtagprog::cable::{cable_by_name, Cable, CableConfig};
use jtagprog::device::altera::Altera;
use jtagprog::device::gowin::Gowin;
use jtagprog::device::lattice::Lattice;
use jtagprog::device::xilinx::Xilinx;
use jtagprog::device::{Device, DATA_DIR};
use jtagprog::display::{print_error, print_info, print_success};
use jtagprog::flash::bpi::BpiFlash;
use jtagprog::icev::IceVWireless;
use jtagprog::parser::{self, FileFormat};
use jtagprog::parts::fpga_by_idcode;
use jtagprog::{Jtag, ProgError, Result};

struct Arguments {
    bit_file: String,
    board: Option<String>,
    cable: Option<String>,
    offset: u32,
    freq: u32,
    display: bool,
    reset: bool,
    verbose: bool,
}

fn parse_args() -> Result<Arguments> {
    let matches = App::new("jtagprog")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Program FPGAs and SPI/BPI flash memories over JTAG")
        .arg(Arg::with_name("bitstream")
            .help("bitstream file (.bit/.svf/.fs/.jed/.rpd/.mcs/raw)")
            .index(1))
        .arg(Arg::with_name("board")
            .help("board name, may be used instead of cable")
            .short("b").long("board").takes_value(true))
        .arg(Arg::with_name("cable")
            .help("jtag interface")
            .short("c").long("cable").takes_value(true))
        .arg(Arg::with_name("offset")
            .help("start offset in EEPROM (hex)")
            .short("o").long("offset").takes_value(true))
        .arg(Arg::with_name("freq")
            .help("JTAG clock frequency in Hz")
            .long("freq").takes_value(true))
        .arg(Arg::with_name("display")
            .help("display FPGA and EEPROM model")
            .short("d").long("display"))
        .arg(Arg::with_name("reset")
            .help("reset FPGA after operations")
            .short("r").long("reset"))
        .arg(Arg::with_name("verbose")
            .help("produce verbose output")
            .short("v").long("verbose"))
        .get_matches();

    let offset = match matches.value_of("offset") {
        Some(text) => {
            let text = text.trim_start_matches("0x").trim_start_matches("0X");
            u32::from_str_radix(text, 16).map_err(|_| {
                ProgError::ConfigError(format!("bad offset value: {}", text))
            })?
        }
        None => 0,
    };
    let freq = match matches.value_of("freq") {
        Some(text) => text.parse().map_err(|_| {
            ProgError::ConfigError(format!("bad frequency value: {}", text))
        })?,
        None => 6_000_000,
    };

    Ok(Arguments {
        bit_file: matches.value_of("bitstream").unwrap_or("").to_string(),
        board: matches.value_of("board").map(|s| s.to_string()),
        cable: matches.value_of("cable").map(|s| s.to_string()),
        offset,
        freq,
        display: matches.is_present("display"),
        reset: matches.is_present("reset"),
        verbose: matches.is_present("verbose"),
    })
}

/// Input payload, parsed before any device I/O so malformed files
/// never touch the cable.
#[derive(Copy, Clone)]
enum Payload {
    None,
    /// Volatile SRAM load.
    Mem(FileFormat),
    /// External flash write.
    Flash(FileFormat),
}

fn classify_input(args: &mut Arguments) -> Result<Payload> {
    if args.bit_file.is_empty() {
        return Ok(Payload::None);
    }
    let format = parser::format_for_path(&args.bit_file);
    match format {
        FileFormat::Bit | FileFormat::Svf | FileFormat::Fs | FileFormat::Jed => {
            Ok(Payload::Mem(format))
        }
        FileFormat::Rpd => {
            // The FPGA must reload the new EEPROM content.
            args.reset = true;
            Ok(Payload::Flash(format))
        }
        FileFormat::Mcs => Ok(Payload::Flash(format)),
        FileFormat::Raw => {
            if args.offset == 0 {
                return Err(ProgError::ConfigError(format!(
                    "{} is not an FPGA bitstream; flashing it at offset 0 makes no sense",
                    args.bit_file
                ))
                .into());
            }
            Ok(Payload::Flash(format))
        }
    }
}

fn run() -> Result<bool> {
    let mut args = parse_args()?;

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let payload = classify_input(&mut args)?;

    // Reading back the EEPROM model needs a bridge in SRAM, which the
    // display path loads itself; the device must then be reset.
    if args.display && !matches!(payload, Payload::Mem(_)) {
        args.reset = true;
    }
    if args.reset && matches!(payload, Payload::Mem(_)) {
        return Err(ProgError::ConfigError(
            "using both an SRAM load and reset makes no sense".into(),
        )
        .into());
    }

    // Parse the input up-front: malformed files abort before the
    // transport opens. Parsed payloads are kept for the drivers that
    // consume them directly.
    let mut fs_bitstream = None;
    let mut jed_file = None;
    match payload {
        Payload::Mem(FileFormat::Bit) => {
            let raw = parser::read_file(&args.bit_file)?;
            let bit = parser::bit::parse(&raw)?;
            if args.verbose || args.display {
                bit.display_header();
            }
        }
        Payload::Mem(FileFormat::Fs) => {
            let raw = parser::read_file(&args.bit_file)?;
            let bs = parser::fs::parse(&raw, true)?;
            if args.verbose || args.display {
                bs.display_header();
            }
            fs_bitstream = Some(bs);
        }
        Payload::Mem(FileFormat::Jed) => {
            let raw = parser::read_file(&args.bit_file)?;
            jed_file = Some(parser::jed::parse(&raw)?);
        }
        Payload::Flash(FileFormat::Mcs) => {
            let raw = parser::read_file(&args.bit_file)?;
            parser::mcs::parse(&raw)?;
        }
        _ => {}
    }

    // Board name -> cable name; explicit cable otherwise; default to
    // a bare ft2232.
    let mut flash_kind = FlashKind::Spi;
    let cable_name = if let Some(board_name) = &args.board {
        let board = board_by_name(board_name).ok_or_else(|| {
            ProgError::ConfigError(format!("unknown board {}", board_name))
        })?;
        flash_kind = board.flash;
        board.cable.to_string()
    } else if let Some(cable) = &args.cable {
        cable.clone()
    } else {
        print_info("No cable or board specified: using direct ft2232 interface");
        "ft2232".to_string()
    };

    let config: &CableConfig = cable_by_name(&cable_name).ok_or_else(|| {
        ProgError::ConfigError(format!("cable {} not found", cable_name))
    })?;

    // The ICE-V link is not JTAG: hand the raw bitstream to the
    // board's MCU and stop there.
    if config.name == "icev_wireless" {
        let mut board = IceVWireless::open(config.address)?;
        let to_ram = matches!(payload, Payload::Mem(_)) || args.offset == 0;
        board.send_file(to_ram, &args.bit_file)?;
        return Ok(true);
    }

    let cable = Cable::open(config, args.freq)?;
    let mut jtag = Jtag::new(cable);

    let devices = jtag.detect_chain(5)?;
    print_info(&format!("found {} devices", devices.len()));
    for idcode in &devices {
        println!("0x{:08x}", idcode);
    }
    if devices.len() != 1 {
        return Err(ProgError::UnsupportedChain(devices.len()).into());
    }

    let idcode = devices[0];
    let model = fpga_by_idcode(idcode).ok_or(ProgError::UnsupportedDevice(idcode))?;
    print_info(&format!(
        "idcode 0x{:08x}\nvendor {}\nmodel  {}\nfamily {}",
        idcode, model.vendor, model.model, model.family
    ));

    // Showing the EEPROM model needs the serial-flash-loader bridge
    // in SRAM; the reset forced earlier restores the device after.
    if args.display && model.vendor == "altera" {
        Altera::new(&mut jtag, "", Some((config.vid, config.pid)))
            .display_eeprom()?;
    }

    let file: &str = &args.bit_file;
    let mut verify_failed = false;

    let prog_result: Result<()> = match model.vendor {
        "xilinx" => {
            if matches!(payload, Payload::Flash(_)) && flash_kind == FlashKind::Bpi {
                program_bpi(&mut jtag, model.family, file, args.offset)
            } else {
                Xilinx::new(&mut jtag, file).program(args.offset)
            }
        }
        "altera" => {
            Altera::new(&mut jtag, file, Some((config.vid, config.pid)))
                .program(args.offset)
        }
        "lattice" => {
            if !file.is_empty() && jed_file.is_none() {
                Err(ProgError::ConfigError(
                    "lattice devices are programmed from a .jed file".into(),
                )
                .into())
            } else {
                Lattice::new(&mut jtag, jed_file.take()).program(args.offset)
            }
        }
        "gowin" => {
            if !file.is_empty() && fs_bitstream.is_none() {
                Err(ProgError::ConfigError(
                    "gowin devices are programmed from a .fs file".into(),
                )
                .into())
            } else {
                Gowin::new(&mut jtag, fs_bitstream.take(), args.verbose)?
                    .program(args.offset)
            }
        }
        other => Err(ProgError::ConfigError(format!(
            "no driver for vendor {}", other
        ))
        .into()),
    };

    match prog_result {
        Ok(()) => {}
        Err(e) => {
            // A verify mismatch is reported but the rest of the run
            // (reset included) still happens.
            let mismatch = e
                .iter_chain()
                .filter_map(|c| c.downcast_ref::<ProgError>())
                .any(|p| matches!(p, ProgError::FlashVerifyMismatch(_)));
            if !mismatch {
                return Err(e);
            }
            print_error(&format!("{}", e));
            verify_failed = true;
        }
    }

    if args.reset {
        debug!("post-program reset");
        match model.vendor {
            "xilinx" => Xilinx::new(&mut jtag, "").reset()?,
            "altera" => Altera::new(&mut jtag, "", None).reset()?,
            "lattice" => Lattice::new(&mut jtag, None).reset()?,
            "gowin" => Gowin::new(&mut jtag, None, args.verbose)?.reset()?,
            _ => {}
        }
    }

    Ok(!verify_failed)
}

/// BPI x16 flash write: put the parallel-NOR bridge into SRAM, then
/// drive the flash through its USER1 protocol.
fn program_bpi(
    jtag: &mut Jtag<Cable>,
    family: &str,
    file: &str,
    offset: u32,
) -> Result<()> {
    let bridge = format!("{}/bpiOverJtag_{}.bit", DATA_DIR, family);
    Xilinx::new(jtag, &bridge).program(0)?;

    let raw = parser::read_file(file)?;
    let image = match parser::format_for_path(file) {
        FileFormat::Mcs => parser::mcs::parse(&raw)?,
        _ => parser::raw::parse(&raw, false)?,
    };

    let mut flash = BpiFlash::new(jtag);
    flash.detect()?;
    flash.write(offset, &image.data)
}

fn exit_code(err: &failure::Error) -> i32 {
    let prog_err = err
        .iter_chain()
        .filter_map(|cause| cause.downcast_ref::<ProgError>())
        .next();
    match prog_err {
        Some(ProgError::ConfigError(_))
        | Some(ProgError::ParseError(_))
        | Some(ProgError::UnsupportedDevice(_))
        | Some(ProgError::UnsupportedChain(_)) => 1,
        _ => 3,
    }
}

fn main() {
    match run() {
        Ok(true) => print_success("Done"),
        Ok(false) => std::process::exit(3),
        Err(e) => {
            print_error(&format!("Error: {}", e));
            std::process::exit(exit_code(&e));
        }
    }
}
