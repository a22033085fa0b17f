// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! melvinctl: poke the metadata cache daemon from the command line.

use clap::{Arg, Command};

use melvind::client::Client;
use melvind::parser::{buf_to_textmap, Entry, TextMapOps};
use melvind::Result;

fn print_reply(buf: &[u8]) {
    let reply = match buf_to_textmap(buf) {
        Ok(r) => r,
        Err(e) => {
            println!("unparseable reply: {}", e);
            return;
        }
    };
    println!(
        "response \"{}\" status \"{}\" reason \"{}\"",
        reply.string_from_textmap("response").unwrap_or(""),
        reply.string_from_textmap("status").unwrap_or(""),
        reply.string_from_textmap("reason").unwrap_or("")
    );
}

fn base_args() -> Vec<(&'static str, Entry)> {
    vec![
        ("pid", Entry::Number(std::process::id() as i64)),
        ("cmd", Entry::String("melvinctl".to_string())),
    ]
}

fn run() -> Result<()> {
    let matches = clap::command!()
        .name("melvinctl")
        .subcommand_required(true)
        .subcommand(Command::new("dump"))
        .subcommand(Command::new("pv_list"))
        .subcommand(Command::new("vg_list"))
        .subcommand(Command::new("get_global_info"))
        .subcommand(Command::new("vg_lookup_name").arg(Arg::new("name").required(true)))
        .subcommand(Command::new("vg_lookup_uuid").arg(Arg::new("uuid").required(true)))
        .subcommand(Command::new("pv_lookup_uuid").arg(Arg::new("uuid").required(true)))
        .subcommand(Command::new("set_global_invalid").arg(Arg::new("val").required(true)))
        .subcommand(Command::new("set_global_disable").arg(Arg::new("val").required(true)))
        .subcommand(
            Command::new("set_vg_version")
                .arg(Arg::new("uuid").required(true).help("VG uuid, or - for none"))
                .arg(Arg::new("name").required(true).help("VG name, or - for none"))
                .arg(Arg::new("version").required(true)),
        )
        .subcommand(Command::new("vg_lock_type").arg(Arg::new("uuid").required(true)))
        .get_matches();

    let mut client = Client::connect_default()?;

    match matches.subcommand().unwrap() {
        ("dump", _) => {
            let buf = client.request_raw("dump", &base_args())?;
            println!("{}", String::from_utf8_lossy(&buf));
        }
        (cmd @ "pv_list", _) | (cmd @ "vg_list", _) | (cmd @ "get_global_info", _) => {
            let buf = client.request_raw(cmd, &base_args())?;
            println!("{}", String::from_utf8_lossy(&buf));
        }
        ("vg_lookup_name", sub) => {
            let name = sub.get_one::<String>("name").unwrap();
            let mut args = base_args();
            args.push(("name", Entry::String(name.clone())));
            let buf = client.request_raw("vg_lookup", &args)?;
            println!("{}", String::from_utf8_lossy(&buf));
        }
        ("vg_lookup_uuid", sub) => {
            let uuid = sub.get_one::<String>("uuid").unwrap();
            let mut args = base_args();
            args.push(("uuid", Entry::String(uuid.clone())));
            let buf = client.request_raw("vg_lookup", &args)?;
            println!("{}", String::from_utf8_lossy(&buf));
        }
        ("pv_lookup_uuid", sub) => {
            let uuid = sub.get_one::<String>("uuid").unwrap();
            let mut args = base_args();
            args.push(("uuid", Entry::String(uuid.clone())));
            let buf = client.request_raw("pv_lookup", &args)?;
            println!("{}", String::from_utf8_lossy(&buf));
        }
        ("set_global_invalid", sub) => {
            let val: i64 = sub
                .get_one::<String>("val")
                .unwrap()
                .parse()
                .unwrap_or_default();
            let mut args = base_args();
            args.push(("global_invalid", Entry::Number(val)));
            let buf = client.request_raw("set_global_info", &args)?;
            print_reply(&buf);
        }
        ("set_global_disable", sub) => {
            let val: i64 = sub
                .get_one::<String>("val")
                .unwrap()
                .parse()
                .unwrap_or_default();
            let mut args = base_args();
            args.push(("global_disable", Entry::Number(val)));
            args.push(("disable_reason", Entry::String("DIRECT".to_string())));
            let buf = client.request_raw("set_global_info", &args)?;
            print_reply(&buf);
        }
        ("set_vg_version", sub) => {
            let uuid = sub.get_one::<String>("uuid").unwrap();
            let name = sub.get_one::<String>("name").unwrap();
            let version: i64 = sub
                .get_one::<String>("version")
                .unwrap()
                .parse()
                .unwrap_or_default();

            let mut args = base_args();
            if uuid != "-" {
                args.push(("uuid", Entry::String(uuid.clone())));
            }
            if name != "-" {
                args.push(("name", Entry::String(name.clone())));
            }
            if uuid == "-" && name == "-" {
                eprintln!("name or uuid required");
                std::process::exit(1);
            }
            args.push(("version", Entry::Number(version)));
            let buf = client.request_raw("set_vg_info", &args)?;
            print_reply(&buf);
        }
        ("vg_lock_type", sub) => {
            let uuid = sub.get_one::<String>("uuid").unwrap();
            let mut args = base_args();
            args.push(("uuid", Entry::String(uuid.clone())));
            let buf = client.request_raw("vg_lookup", &args)?;
            let reply = buf_to_textmap(&buf)?;

            match reply.find_string("metadata/lock_type") {
                Some(lock_type) => println!("lock_type {}", lock_type),
                None => {
                    if reply.textmap_from_textmap("metadata").is_none() {
                        println!("no metadata");
                    } else {
                        println!("no lock_type");
                    }
                }
            }
        }
        _ => unreachable!(),
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("melvinctl: {}", e);
        std::process::exit(1);
    }
}
